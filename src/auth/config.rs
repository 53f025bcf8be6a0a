use std::fmt;

use rocket::http::SameSite;

use crate::auth::{AuthError, AuthResult};

const MIN_SECRET_LEN: usize = 32;

/// Authentication configuration loaded from environment variables.
#[derive(Clone)]
pub struct AuthConfig {
    pub access_token_secret: Vec<u8>,
    pub access_token_ttl_secs: i64,
    pub refresh_token_secret: Vec<u8>,
    pub refresh_token_ttl_secs: i64,
    pub refresh_cookie_name: String,
    pub cookie_domain: Option<String>,
    pub cookie_secure: bool,
    pub cookie_same_site: SameSite,
    pub revoke_on_logout: bool,
    pub revoke_all_on_reuse: bool,
    pub ledger_cleanup_secs: u64,
}

impl AuthConfig {
    pub fn from_env() -> AuthResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup. `from_env` is the
    /// production entry point; tests pass a map.
    pub fn from_lookup<F>(lookup: F) -> AuthResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let access_token_secret = lookup("CODEKATA_ACCESS_TOKEN_SECRET")
            .ok_or_else(|| AuthError::Config("CODEKATA_ACCESS_TOKEN_SECRET is required".into()))?
            .into_bytes();
        let refresh_token_secret = lookup("CODEKATA_REFRESH_TOKEN_SECRET")
            .ok_or_else(|| AuthError::Config("CODEKATA_REFRESH_TOKEN_SECRET is required".into()))?
            .into_bytes();

        if access_token_secret.len() < MIN_SECRET_LEN || refresh_token_secret.len() < MIN_SECRET_LEN
        {
            return Err(AuthError::Config(format!(
                "token secrets must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        if access_token_secret == refresh_token_secret {
            return Err(AuthError::Config(
                "access and refresh token secrets must differ".into(),
            ));
        }

        let access_token_ttl_secs = parse_or(&lookup, "CODEKATA_ACCESS_TOKEN_TTL_SECS", 2 * 60 * 60)?;
        let refresh_token_ttl_secs =
            parse_or(&lookup, "CODEKATA_REFRESH_TOKEN_TTL_SECS", 24 * 60 * 60)?;
        if access_token_ttl_secs <= 0 || refresh_token_ttl_secs <= 0 {
            return Err(AuthError::Config("token lifetimes must be positive".into()));
        }

        let refresh_cookie_name = lookup("CODEKATA_REFRESH_COOKIE_NAME")
            .unwrap_or_else(|| "codekata_refresh".into());
        let cookie_domain = lookup("CODEKATA_COOKIE_DOMAIN");
        let cookie_secure = flag_or(&lookup, "CODEKATA_COOKIE_SECURE", true);
        let cookie_same_site = match lookup("CODEKATA_COOKIE_SAME_SITE")
            .map(|value| value.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("lax") => SameSite::Lax,
            Some("strict") => SameSite::Strict,
            Some("none") => SameSite::None,
            Some(other) => {
                return Err(AuthError::Config(format!(
                    "unsupported CODEKATA_COOKIE_SAME_SITE value '{other}'"
                )));
            }
        };

        let revoke_on_logout = flag_or(&lookup, "CODEKATA_REVOKE_ON_LOGOUT", true);
        let revoke_all_on_reuse = flag_or(&lookup, "CODEKATA_REVOKE_ALL_ON_REUSE", false);
        let ledger_cleanup_secs = parse_or(&lookup, "CODEKATA_LEDGER_CLEANUP_SECS", 60 * 60)?;

        Ok(Self {
            access_token_secret,
            access_token_ttl_secs,
            refresh_token_secret,
            refresh_token_ttl_secs,
            refresh_cookie_name,
            cookie_domain,
            cookie_secure,
            cookie_same_site,
            revoke_on_logout,
            revoke_all_on_reuse,
            ledger_cleanup_secs,
        })
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("access_token_secret", &"<redacted>")
            .field("access_token_ttl_secs", &self.access_token_ttl_secs)
            .field("refresh_token_secret", &"<redacted>")
            .field("refresh_token_ttl_secs", &self.refresh_token_ttl_secs)
            .field("refresh_cookie_name", &self.refresh_cookie_name)
            .field("cookie_domain", &self.cookie_domain)
            .field("cookie_secure", &self.cookie_secure)
            .field("cookie_same_site", &self.cookie_same_site)
            .field("revoke_on_logout", &self.revoke_on_logout)
            .field("revoke_all_on_reuse", &self.revoke_all_on_reuse)
            .field("ledger_cleanup_secs", &self.ledger_cleanup_secs)
            .finish()
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> AuthResult<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AuthError::Config(format!("{key} has an invalid value '{raw}'"))),
        None => Ok(default),
    }
}

fn flag_or<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "on"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const ACCESS: &str = "access-secret-access-secret-access-secret";
    const REFRESH: &str = "refresh-secret-refresh-secret-refresh-secret";

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn applies_defaults_when_only_secrets_are_set() {
        let config = AuthConfig::from_lookup(lookup(&[
            ("CODEKATA_ACCESS_TOKEN_SECRET", ACCESS),
            ("CODEKATA_REFRESH_TOKEN_SECRET", REFRESH),
        ]))
        .expect("config");

        assert_eq!(config.access_token_ttl_secs, 7200);
        assert_eq!(config.refresh_token_ttl_secs, 86400);
        assert_eq!(config.refresh_cookie_name, "codekata_refresh");
        assert!(config.cookie_secure);
        assert!(config.revoke_on_logout);
        assert!(!config.revoke_all_on_reuse);
        assert_eq!(config.cookie_same_site, SameSite::Lax);
    }

    #[test]
    fn rejects_missing_short_or_shared_secrets() {
        assert!(AuthConfig::from_lookup(lookup(&[("CODEKATA_ACCESS_TOKEN_SECRET", ACCESS)])).is_err());
        assert!(
            AuthConfig::from_lookup(lookup(&[
                ("CODEKATA_ACCESS_TOKEN_SECRET", "short"),
                ("CODEKATA_REFRESH_TOKEN_SECRET", REFRESH),
            ]))
            .is_err()
        );
        assert!(
            AuthConfig::from_lookup(lookup(&[
                ("CODEKATA_ACCESS_TOKEN_SECRET", ACCESS),
                ("CODEKATA_REFRESH_TOKEN_SECRET", ACCESS),
            ]))
            .is_err()
        );
    }

    #[test]
    fn rejects_non_positive_lifetimes() {
        let result = AuthConfig::from_lookup(lookup(&[
            ("CODEKATA_ACCESS_TOKEN_SECRET", ACCESS),
            ("CODEKATA_REFRESH_TOKEN_SECRET", REFRESH),
            ("CODEKATA_ACCESS_TOKEN_TTL_SECS", "0"),
        ]));
        assert!(matches!(result, Err(AuthError::Config(_))));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let config = AuthConfig::from_lookup(lookup(&[
            ("CODEKATA_ACCESS_TOKEN_SECRET", ACCESS),
            ("CODEKATA_REFRESH_TOKEN_SECRET", REFRESH),
        ]))
        .expect("config");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains(ACCESS));
        assert!(!rendered.contains(REFRESH));
    }
}
