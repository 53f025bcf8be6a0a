//! OAuth identity providers: exchange an authorization code for the user's
//! profile at the provider. One implementation per provider, selected by key.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::{AuthError, AuthResult};

/// Profile as reported by an external provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub provider_user_id: String,
    pub email: Option<String>,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub provider_name: String,
}

/// Public client-side settings for starting the OAuth dance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub provider: String,
    pub client_id: String,
    pub auth_url: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

#[rocket::async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn resolve_profile(&self, authorization_code: &str) -> AuthResult<ProviderProfile>;

    fn descriptor(&self) -> ProviderDescriptor;
}

/// Providers keyed by the name clients send as `provider_key`.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn IdentityProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, key: impl Into<String>, provider: Arc<dyn IdentityProvider>) -> Self {
        self.providers.insert(key.into(), provider);
        self
    }

    pub fn get(&self, key: &str) -> AuthResult<&Arc<dyn IdentityProvider>> {
        self.providers
            .get(key)
            .ok_or_else(|| AuthError::UnknownProvider(key.to_string()))
    }

    pub fn descriptors(&self) -> Vec<ProviderDescriptor> {
        self.providers.values().map(|p| p.descriptor()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Register every provider whose credentials are present in the environment.
    pub fn from_env() -> AuthResult<Self> {
        let mut registry = Self::new();
        if let Some(config) = OAuthClientConfig::yandex_from_lookup(|key| std::env::var(key).ok())? {
            let provider = YandexProvider::new(config)?;
            registry = registry.with_provider(YANDEX, Arc::new(provider));
        } else {
            log::warn!("CLIENT_ID_YANDEX not set; yandex login disabled");
        }
        Ok(registry)
    }
}

pub const YANDEX: &str = "yandex";

#[derive(Debug, Clone)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
    pub auth_url: String,
    pub token_url: String,
    pub user_info_url: String,
    pub scopes: Vec<String>,
}

impl OAuthClientConfig {
    /// `None` when `CLIENT_ID_YANDEX` is unset. A client id without its
    /// secret is a configuration error.
    fn yandex_from_lookup<F>(lookup: F) -> AuthResult<Option<Self>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(client_id) = lookup("CLIENT_ID_YANDEX").filter(|id| !id.trim().is_empty()) else {
            return Ok(None);
        };
        let client_secret = lookup("CLIENT_SECRET_YANDEX")
            .filter(|secret| !secret.trim().is_empty())
            .ok_or_else(|| {
                AuthError::Config("CLIENT_ID_YANDEX is set but CLIENT_SECRET_YANDEX is missing".into())
            })?;
        let app_root = lookup("APP_ROOT").unwrap_or_else(|| "http://localhost:3000".into());

        Ok(Some(Self {
            client_id,
            client_secret,
            redirect_url: format!("{}/YandexAuthCallback", app_root.trim_end_matches('/')),
            auth_url: "https://oauth.yandex.ru/authorize".into(),
            token_url: "https://oauth.yandex.ru/token".into(),
            user_info_url: "https://login.yandex.ru/info?format=json".into(),
            scopes: vec!["login:email".into(), "login:info".into()],
        }))
    }
}

#[derive(Debug, Deserialize)]
struct TokenExchangeResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct YandexUserInfo {
    id: String,
    #[serde(default)]
    login: Option<String>,
    #[serde(default)]
    default_email: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    real_name: Option<String>,
    #[serde(default)]
    default_avatar_id: Option<String>,
    #[serde(default)]
    is_avatar_empty: bool,
}

impl YandexUserInfo {
    fn into_profile(self) -> ProviderProfile {
        let display_name = self
            .real_name
            .or(self.display_name)
            .or(self.login)
            .unwrap_or_default();
        let avatar_url = match (self.is_avatar_empty, self.default_avatar_id) {
            (false, Some(avatar_id)) => Some(format!(
                "https://avatars.yandex.net/get-yapic/{avatar_id}/islands-200"
            )),
            _ => None,
        };

        ProviderProfile {
            provider_user_id: self.id,
            email: self.default_email,
            display_name,
            avatar_url,
            provider_name: YANDEX.to_string(),
        }
    }
}

pub struct YandexProvider {
    config: OAuthClientConfig,
    http: reqwest::Client,
}

impl YandexProvider {
    pub fn new(config: OAuthClientConfig) -> AuthResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { config, http })
    }

    async fn exchange_code(&self, authorization_code: &str) -> AuthResult<String> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", authorization_code),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("redirect_uri", self.config.redirect_url.as_str()),
        ];

        let response = self
            .http
            .post(&self.config.token_url)
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AuthError::ProviderRejected(format!(
                "token exchange returned {}",
                response.status()
            )));
        }

        let body: TokenExchangeResponse = response.json().await?;
        Ok(body.access_token)
    }
}

#[rocket::async_trait]
impl IdentityProvider for YandexProvider {
    async fn resolve_profile(&self, authorization_code: &str) -> AuthResult<ProviderProfile> {
        if authorization_code.trim().is_empty() {
            return Err(AuthError::ProviderRejected("empty authorization code".into()));
        }

        let access_token = self.exchange_code(authorization_code).await?;

        let response = self
            .http
            .get(&self.config.user_info_url)
            .header("Authorization", format!("OAuth {access_token}"))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AuthError::ProviderRejected(format!(
                "profile request returned {}",
                response.status()
            )));
        }

        let info: YandexUserInfo = response.json().await?;
        Ok(info.into_profile())
    }

    fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            provider: YANDEX.to_string(),
            client_id: self.config.client_id.clone(),
            auth_url: self.config.auth_url.clone(),
            redirect_uri: self.config.redirect_url.clone(),
            scopes: self.config.scopes.clone(),
        }
    }
}
