use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Internal user identifier shared by tokens, the ledger and the identity store.
pub type UserId = i64;

/// Which signer a token belongs to. Carried inside the signed payload so a
/// verifier can refuse tokens minted for the other purpose.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub user_id: UserId,
    pub is_admin: bool,
    pub token_kind: TokenKind,
    /// Random per-token id; two tokens minted in the same second for the same
    /// user still differ.
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() > self.exp
    }
}

/// Result of a successful login or refresh. Never persisted.
#[derive(Debug, Clone)]
pub struct AuthData {
    pub user_id: UserId,
    pub access_token: String,
    pub refresh_token: String,
    pub refresh_expires_at: DateTime<Utc>,
}
