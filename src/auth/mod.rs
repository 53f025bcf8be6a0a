//! Authentication module: configuration, token signing, the refresh-token
//! ledger, identity resolution, the login/refresh/logout flows, Rocket request
//! guards and HTTP route handlers.

use std::sync::Arc;

use chrono::Duration;

pub mod claims;
pub mod config;
pub mod error;
pub mod guards;
pub mod identity;
pub mod jwt;
pub mod memory;
pub mod providers;
pub mod refresh_store;
pub mod routes;
pub mod session;

pub use claims::{AuthData, Claims, TokenKind, UserId};
pub use config::AuthConfig;
pub use error::{AuthError, AuthResult};
pub use guards::{AuthUser, RequireAdmin};
pub use identity::{IdentityStore, PgIdentityStore};
pub use jwt::TokenSigner;
pub use providers::{IdentityProvider, ProviderProfile, ProviderRegistry};
pub use refresh_store::{PgRefreshTokenLedger, RefreshTokenLedger};
pub use session::ClientContext;

#[derive(Clone)]
pub struct AuthState {
    pub config: AuthConfig,
    pub access_tokens: Arc<TokenSigner>,
    pub refresh_tokens: Arc<TokenSigner>,
    pub ledger: Arc<dyn RefreshTokenLedger>,
    pub identities: Arc<dyn IdentityStore>,
    pub providers: ProviderRegistry,
}

impl AuthState {
    pub fn new(
        config: AuthConfig,
        ledger: Arc<dyn RefreshTokenLedger>,
        identities: Arc<dyn IdentityStore>,
        providers: ProviderRegistry,
    ) -> Self {
        let access_tokens = TokenSigner::new(
            TokenKind::Access,
            &config.access_token_secret,
            Duration::seconds(config.access_token_ttl_secs),
        );
        let refresh_tokens = TokenSigner::new(
            TokenKind::Refresh,
            &config.refresh_token_secret,
            Duration::seconds(config.refresh_token_ttl_secs),
        );

        Self {
            config,
            access_tokens: Arc::new(access_tokens),
            refresh_tokens: Arc::new(refresh_tokens),
            ledger,
            identities,
            providers,
        }
    }
}
