//! Durable bookkeeping of issued refresh tokens.
//!
//! Rows are keyed by the SHA-256 digest of the signed token string. A row is
//! only ever mutated to flip `revoked` to true; rotation revokes the presented
//! row and inserts its replacement inside one transaction, and the revoke is a
//! conditional update so that exactly one of several concurrent callers wins.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use chrono::{DateTime, Utc};
use rocket_db_pools::sqlx::{self, FromRow, PgPool};
use sha2::{Digest, Sha256};
use tokio::time::MissedTickBehavior;

use crate::auth::claims::UserId;
use crate::auth::error::is_unique_violation;
use crate::auth::{AuthError, AuthResult};

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct RefreshTokenRecord {
    pub id: i64,
    pub user_id: UserId,
    pub token_hash: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

impl RefreshTokenRecord {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && self.expires_at > now
    }

    /// Map an unusable record to the ledger error describing why.
    pub fn ensure_active(&self, now: DateTime<Utc>) -> AuthResult<()> {
        if self.revoked {
            Err(AuthError::Revoked {
                user_id: self.user_id,
            })
        } else if self.expires_at <= now {
            Err(AuthError::Expired)
        } else {
            Ok(())
        }
    }
}

/// A refresh token about to be recorded.
#[derive(Debug, Clone)]
pub struct NewRefreshToken {
    pub user_id: UserId,
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

#[rocket::async_trait]
pub trait RefreshTokenLedger: Send + Sync {
    /// Record a new active token. Fails with `DuplicateToken` rather than
    /// overwriting an existing row.
    async fn create(&self, record: NewRefreshToken) -> AuthResult<RefreshTokenRecord>;

    async fn find_by_token(&self, token: &str) -> AuthResult<RefreshTokenRecord>;

    /// Mark the token revoked. Unknown and already revoked tokens are not errors.
    async fn revoke(&self, token: &str) -> AuthResult<()>;

    /// Atomically claim `token` (active, unexpired at `now`) and record
    /// `replacement`. Nothing is written unless the claim succeeds.
    async fn rotate(
        &self,
        token: &str,
        replacement: NewRefreshToken,
        now: DateTime<Utc>,
    ) -> AuthResult<RefreshTokenRecord>;

    async fn delete_all_for_user(&self, user_id: UserId) -> AuthResult<u64>;

    /// Remove rows past their expiry. Revoked rows stay until then so a
    /// replay is still recognised as reuse.
    async fn cleanup_expired(&self, now: DateTime<Utc>) -> AuthResult<u64>;
}

pub fn token_digest(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    STANDARD_NO_PAD.encode(digest)
}

#[derive(Debug, Clone)]
pub struct PgRefreshTokenLedger {
    pool: PgPool,
}

impl PgRefreshTokenLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Explain why a claim failed: absent, revoked or expired.
    async fn classify_failed_claim(&self, token_hash: &str, now: DateTime<Utc>) -> AuthError {
        match self.find_by_hash(token_hash).await {
            Ok(record) => match record.ensure_active(now) {
                Err(err) => err,
                // Rows are never un-revoked; an active row here lost a race.
                Ok(()) => AuthError::Revoked {
                    user_id: record.user_id,
                },
            },
            Err(err) => err,
        }
    }

    async fn find_by_hash(&self, token_hash: &str) -> AuthResult<RefreshTokenRecord> {
        sqlx::query_as::<_, RefreshTokenRecord>(
            "SELECT id, user_id, token_hash, issued_at, expires_at, revoked, user_agent, ip_address FROM refresh_tokens WHERE token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AuthError::NotFound)
    }
}

const INSERT_SQL: &str = "INSERT INTO refresh_tokens (user_id, token_hash, issued_at, expires_at, revoked, user_agent, ip_address) VALUES ($1, $2, $3, $4, FALSE, $5, $6) RETURNING id, user_id, token_hash, issued_at, expires_at, revoked, user_agent, ip_address";

fn map_insert_error(err: sqlx::Error) -> AuthError {
    if is_unique_violation(&err) {
        AuthError::DuplicateToken
    } else {
        AuthError::Sqlx(err)
    }
}

#[rocket::async_trait]
impl RefreshTokenLedger for PgRefreshTokenLedger {
    async fn create(&self, record: NewRefreshToken) -> AuthResult<RefreshTokenRecord> {
        sqlx::query_as::<_, RefreshTokenRecord>(INSERT_SQL)
            .bind(record.user_id)
            .bind(token_digest(&record.token))
            .bind(record.issued_at)
            .bind(record.expires_at)
            .bind(record.user_agent)
            .bind(record.ip_address)
            .fetch_one(&self.pool)
            .await
            .map_err(map_insert_error)
    }

    async fn find_by_token(&self, token: &str) -> AuthResult<RefreshTokenRecord> {
        self.find_by_hash(&token_digest(token)).await
    }

    async fn revoke(&self, token: &str) -> AuthResult<()> {
        sqlx::query("UPDATE refresh_tokens SET revoked = TRUE WHERE token_hash = $1 AND revoked = FALSE")
            .bind(token_digest(token))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn rotate(
        &self,
        token: &str,
        replacement: NewRefreshToken,
        now: DateTime<Utc>,
    ) -> AuthResult<RefreshTokenRecord> {
        let token_hash = token_digest(token);
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            "UPDATE refresh_tokens SET revoked = TRUE WHERE token_hash = $1 AND revoked = FALSE AND expires_at > $2",
        )
        .bind(&token_hash)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() != 1 {
            tx.rollback().await?;
            return Err(self.classify_failed_claim(&token_hash, now).await);
        }

        let record = sqlx::query_as::<_, RefreshTokenRecord>(INSERT_SQL)
            .bind(replacement.user_id)
            .bind(token_digest(&replacement.token))
            .bind(replacement.issued_at)
            .bind(replacement.expires_at)
            .bind(replacement.user_agent)
            .bind(replacement.ip_address)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_insert_error)?;

        tx.commit().await?;
        Ok(record)
    }

    async fn delete_all_for_user(&self, user_id: UserId) -> AuthResult<u64> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> AuthResult<u64> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Purge expired rows every `period`. Never returns; spawn it.
pub async fn run_cleanup_loop(ledger: Arc<dyn RefreshTokenLedger>, period: StdDuration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match ledger.cleanup_expired(Utc::now()).await {
            Ok(0) => {}
            Ok(removed) => log::info!("ledger cleanup removed {} refresh tokens", removed),
            Err(err) => log::warn!("ledger cleanup failed: {}", err),
        }
    }
}
