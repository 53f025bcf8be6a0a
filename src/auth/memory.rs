//! Process-local ledger and identity store. Each operation runs under one
//! lock, which gives the same use-once guarantee as the conditional update in
//! Postgres, but only within a single process.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::auth::claims::UserId;
use crate::auth::identity::{IdentityStore, display_name};
use crate::auth::providers::ProviderProfile;
use crate::auth::refresh_store::{
    NewRefreshToken, RefreshTokenLedger, RefreshTokenRecord, token_digest,
};
use crate::auth::{AuthError, AuthResult};
use crate::models::{ProviderLink, User};

#[derive(Default)]
struct LedgerRows {
    next_id: i64,
    by_hash: HashMap<String, RefreshTokenRecord>,
}

impl LedgerRows {
    fn insert(&mut self, record: NewRefreshToken) -> AuthResult<RefreshTokenRecord> {
        let token_hash = token_digest(&record.token);
        if self.by_hash.contains_key(&token_hash) {
            return Err(AuthError::DuplicateToken);
        }

        self.next_id += 1;
        let row = RefreshTokenRecord {
            id: self.next_id,
            user_id: record.user_id,
            token_hash: token_hash.clone(),
            issued_at: record.issued_at,
            expires_at: record.expires_at,
            revoked: false,
            user_agent: record.user_agent,
            ip_address: record.ip_address,
        };
        self.by_hash.insert(token_hash, row.clone());
        Ok(row)
    }
}

#[derive(Default)]
pub struct InMemoryRefreshTokenLedger {
    rows: Mutex<LedgerRows>,
}

impl InMemoryRefreshTokenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records_for_user(&self, user_id: UserId) -> Vec<RefreshTokenRecord> {
        let mut records: Vec<_> = self
            .rows
            .lock()
            .by_hash
            .values()
            .filter(|row| row.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by_key(|row| row.id);
        records
    }
}

#[rocket::async_trait]
impl RefreshTokenLedger for InMemoryRefreshTokenLedger {
    async fn create(&self, record: NewRefreshToken) -> AuthResult<RefreshTokenRecord> {
        self.rows.lock().insert(record)
    }

    async fn find_by_token(&self, token: &str) -> AuthResult<RefreshTokenRecord> {
        self.rows
            .lock()
            .by_hash
            .get(&token_digest(token))
            .cloned()
            .ok_or(AuthError::NotFound)
    }

    async fn revoke(&self, token: &str) -> AuthResult<()> {
        if let Some(row) = self.rows.lock().by_hash.get_mut(&token_digest(token)) {
            row.revoked = true;
        }
        Ok(())
    }

    async fn rotate(
        &self,
        token: &str,
        replacement: NewRefreshToken,
        now: DateTime<Utc>,
    ) -> AuthResult<RefreshTokenRecord> {
        let token_hash = token_digest(token);
        let mut rows = self.rows.lock();

        match rows.by_hash.get(&token_hash) {
            Some(row) => row.ensure_active(now)?,
            None => return Err(AuthError::NotFound),
        }
        if rows.by_hash.contains_key(&token_digest(&replacement.token)) {
            return Err(AuthError::DuplicateToken);
        }

        if let Some(row) = rows.by_hash.get_mut(&token_hash) {
            row.revoked = true;
        }
        rows.insert(replacement)
    }

    async fn delete_all_for_user(&self, user_id: UserId) -> AuthResult<u64> {
        let mut rows = self.rows.lock();
        let before = rows.by_hash.len();
        rows.by_hash.retain(|_, row| row.user_id != user_id);
        Ok((before - rows.by_hash.len()) as u64)
    }

    async fn cleanup_expired(&self, now: DateTime<Utc>) -> AuthResult<u64> {
        let mut rows = self.rows.lock();
        let before = rows.by_hash.len();
        rows.by_hash.retain(|_, row| row.expires_at > now);
        Ok((before - rows.by_hash.len()) as u64)
    }
}

#[derive(Default)]
struct IdentityRows {
    next_user_id: UserId,
    users: HashMap<UserId, User>,
    links: HashMap<(String, String), ProviderLink>,
}

#[derive(Default)]
pub struct InMemoryIdentityStore {
    rows: Mutex<IdentityRows>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user_count(&self) -> usize {
        self.rows.lock().users.len()
    }

    pub fn link_count(&self) -> usize {
        self.rows.lock().links.len()
    }
}

#[rocket::async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn find_link_by_provider_uid(
        &self,
        provider_uid: &str,
        provider: &str,
    ) -> AuthResult<Option<ProviderLink>> {
        let key = (provider.to_string(), provider_uid.to_string());
        Ok(self.rows.lock().links.get(&key).cloned())
    }

    async fn create_user(&self, profile: &ProviderProfile) -> AuthResult<User> {
        let mut rows = self.rows.lock();
        rows.next_user_id += 1;
        let user = User {
            id: rows.next_user_id,
            name: display_name(profile),
            email: profile.email.clone(),
            avatar_url: profile.avatar_url.clone(),
            is_admin: false,
            created_at: Utc::now(),
        };
        rows.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn link_provider(
        &self,
        profile: &ProviderProfile,
        user_id: UserId,
    ) -> AuthResult<ProviderLink> {
        let mut rows = self.rows.lock();
        if !rows.users.contains_key(&user_id) {
            return Err(AuthError::UserNotFound(user_id));
        }

        let key = (
            profile.provider_name.clone(),
            profile.provider_user_id.clone(),
        );
        if rows.links.contains_key(&key) {
            return Err(AuthError::DuplicateLink);
        }

        let link = ProviderLink {
            user_id,
            provider: profile.provider_name.clone(),
            provider_uid: profile.provider_user_id.clone(),
            name: display_name(profile),
        };
        rows.links.insert(key, link.clone());
        Ok(link)
    }

    async fn get_user(&self, user_id: UserId) -> AuthResult<User> {
        self.rows
            .lock()
            .users
            .get(&user_id)
            .cloned()
            .ok_or(AuthError::UserNotFound(user_id))
    }

    async fn set_admin(&self, user_id: UserId, is_admin: bool) -> AuthResult<User> {
        let mut rows = self.rows.lock();
        let user = rows
            .users
            .get_mut(&user_id)
            .ok_or(AuthError::UserNotFound(user_id))?;
        user.is_admin = is_admin;
        Ok(user.clone())
    }
}
