//! Internal user records and their links to external provider accounts.

use rocket_db_pools::sqlx::{self, PgPool};

use crate::auth::claims::UserId;
use crate::auth::error::is_unique_violation;
use crate::auth::providers::ProviderProfile;
use crate::auth::{AuthError, AuthResult};
use crate::models::{ProviderLink, User};

#[rocket::async_trait]
pub trait IdentityStore: Send + Sync {
    async fn find_link_by_provider_uid(
        &self,
        provider_uid: &str,
        provider: &str,
    ) -> AuthResult<Option<ProviderLink>>;

    /// Create a non-admin user from a provider profile.
    async fn create_user(&self, profile: &ProviderProfile) -> AuthResult<User>;

    /// Fails with `DuplicateLink` when the provider account is already bound.
    async fn link_provider(
        &self,
        profile: &ProviderProfile,
        user_id: UserId,
    ) -> AuthResult<ProviderLink>;

    /// Current record, including the admin flag as it stands now.
    async fn get_user(&self, user_id: UserId) -> AuthResult<User>;

    async fn set_admin(&self, user_id: UserId, is_admin: bool) -> AuthResult<User>;
}

pub(crate) fn display_name(profile: &ProviderProfile) -> String {
    [
        Some(profile.display_name.as_str()),
        profile.email.as_deref(),
        Some(profile.provider_user_id.as_str()),
    ]
    .into_iter()
    .flatten()
    .map(str::trim)
    .find(|candidate| !candidate.is_empty())
    .unwrap_or("user")
    .to_string()
}

#[derive(Debug, Clone)]
pub struct PgIdentityStore {
    pool: PgPool,
}

impl PgIdentityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const USER_COLUMNS: &str = "id, name, email, avatar_url, is_admin, created_at";

#[rocket::async_trait]
impl IdentityStore for PgIdentityStore {
    async fn find_link_by_provider_uid(
        &self,
        provider_uid: &str,
        provider: &str,
    ) -> AuthResult<Option<ProviderLink>> {
        let link = sqlx::query_as::<_, ProviderLink>(
            "SELECT user_id, provider, provider_uid, name FROM user_auth_providers WHERE provider_uid = $1 AND provider = $2",
        )
        .bind(provider_uid)
        .bind(provider)
        .fetch_optional(&self.pool)
        .await?;
        Ok(link)
    }

    async fn create_user(&self, profile: &ProviderProfile) -> AuthResult<User> {
        let user = sqlx::query_as::<_, User>(&format!(
            "INSERT INTO users (name, email, avatar_url, is_admin) VALUES ($1, $2, $3, FALSE) RETURNING {USER_COLUMNS}"
        ))
        .bind(display_name(profile))
        .bind(profile.email.as_deref())
        .bind(profile.avatar_url.as_deref())
        .fetch_one(&self.pool)
        .await?;
        Ok(user)
    }

    async fn link_provider(
        &self,
        profile: &ProviderProfile,
        user_id: UserId,
    ) -> AuthResult<ProviderLink> {
        sqlx::query_as::<_, ProviderLink>(
            "INSERT INTO user_auth_providers (user_id, provider, provider_uid, name) VALUES ($1, $2, $3, $4) RETURNING user_id, provider, provider_uid, name",
        )
        .bind(user_id)
        .bind(&profile.provider_name)
        .bind(&profile.provider_user_id)
        .bind(display_name(profile))
        .fetch_one(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                AuthError::DuplicateLink
            } else {
                AuthError::Sqlx(err)
            }
        })
    }

    async fn get_user(&self, user_id: UserId) -> AuthResult<User> {
        sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AuthError::UserNotFound(user_id))
    }

    async fn set_admin(&self, user_id: UserId, is_admin: bool) -> AuthResult<User> {
        sqlx::query_as::<_, User>(&format!(
            "UPDATE users SET is_admin = $1 WHERE id = $2 RETURNING {USER_COLUMNS}"
        ))
        .bind(is_admin)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AuthError::UserNotFound(user_id))
    }
}
