//! Session lifecycle: login, refresh-token rotation, logout and per-request
//! authorization.

use chrono::{DateTime, Utc};

use crate::auth::claims::{AuthData, Claims, UserId};
use crate::auth::jwt::SignedToken;
use crate::auth::providers::ProviderProfile;
use crate::auth::refresh_store::NewRefreshToken;
use crate::auth::{AuthError, AuthResult, AuthState};

/// Provenance recorded with each new refresh token. Informational only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientContext {
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

impl AuthState {
    /// Exchange a provider authorization code for a fresh token pair,
    /// creating the internal user on first sight of the provider account.
    pub async fn login(
        &self,
        provider_key: &str,
        authorization_code: &str,
        client: &ClientContext,
    ) -> AuthResult<AuthData> {
        let provider = self.providers.get(provider_key)?;
        let profile = provider.resolve_profile(authorization_code).await?;
        let user_id = self.resolve_user(&profile).await?;

        // Admin status is read fresh; it may have changed since the account was created.
        let user = self.identities.get_user(user_id).await?;
        let now = Utc::now();

        let refresh = self.refresh_tokens.issue_at(user.id, user.is_admin, now)?;
        self.ledger
            .create(new_record(user.id, &refresh, now, client))
            .await?;
        let access = self.access_tokens.issue_at(user.id, user.is_admin, now)?;

        log::info!("user {} logged in via {}", user.id, provider_key);

        Ok(AuthData {
            user_id: user.id,
            access_token: access.token,
            refresh_token: refresh.token,
            refresh_expires_at: refresh.expires_at,
        })
    }

    /// Rotate a refresh token. Every credential failure surfaces as
    /// `Unauthorized`; the specific cause is only logged.
    pub async fn refresh(&self, refresh_token: &str, client: &ClientContext) -> AuthResult<AuthData> {
        self.refresh_at(refresh_token, client, Utc::now()).await
    }

    pub async fn refresh_at(
        &self,
        refresh_token: &str,
        client: &ClientContext,
        now: DateTime<Utc>,
    ) -> AuthResult<AuthData> {
        self.rotate(refresh_token, client, now)
            .await
            .map_err(AuthError::into_opaque)
    }

    async fn rotate(
        &self,
        refresh_token: &str,
        client: &ClientContext,
        now: DateTime<Utc>,
    ) -> AuthResult<AuthData> {
        // Ledger first: a revoked token with a perfectly good signature must
        // still be refused.
        let record = match self.ledger.find_by_token(refresh_token).await {
            Ok(record) => record,
            Err(err) => return Err(self.on_rejected_refresh(err).await),
        };
        if let Err(err) = record.ensure_active(now) {
            return Err(self.on_rejected_refresh(err).await);
        }

        let claims = self.refresh_tokens.verify_at(refresh_token, now)?;
        if claims.user_id != record.user_id {
            log::error!(
                "refresh token claims user {} but ledger row {} belongs to user {}",
                claims.user_id,
                record.id,
                record.user_id
            );
            return Err(AuthError::InvalidSignature);
        }

        let user = self.identities.get_user(claims.user_id).await?;
        let refresh = self.refresh_tokens.issue_at(user.id, user.is_admin, now)?;

        // The conditional claim inside `rotate` decides the race between
        // concurrent presenters of the same token.
        if let Err(err) = self
            .ledger
            .rotate(refresh_token, new_record(user.id, &refresh, now, client), now)
            .await
        {
            return Err(self.on_rejected_refresh(err).await);
        }

        let access = self.access_tokens.issue_at(user.id, user.is_admin, now)?;
        log::debug!("rotated refresh token {} for user {}", record.id, user.id);

        Ok(AuthData {
            user_id: user.id,
            access_token: access.token,
            refresh_token: refresh.token,
            refresh_expires_at: refresh.expires_at,
        })
    }

    async fn on_rejected_refresh(&self, err: AuthError) -> AuthError {
        if let AuthError::Revoked { user_id } = &err {
            log::warn!("revoked refresh token presented for user {}", user_id);
            if self.config.revoke_all_on_reuse {
                match self.ledger.delete_all_for_user(*user_id).await {
                    Ok(removed) => log::warn!(
                        "reuse detected: dropped {} refresh tokens of user {}",
                        removed,
                        user_id
                    ),
                    Err(cleanup_err) => log::error!(
                        "failed to drop refresh tokens of user {}: {}",
                        user_id,
                        cleanup_err
                    ),
                }
            }
        }
        err
    }

    /// End a session. Revokes the presented refresh token when configured to.
    /// A missing or unknown token is not an error.
    pub async fn logout(&self, refresh_token: Option<&str>) -> AuthResult<()> {
        match refresh_token {
            Some(token) if self.config.revoke_on_logout => self.ledger.revoke(token).await,
            _ => Ok(()),
        }
    }

    /// End every session of an authenticated user by dropping all of their
    /// refresh tokens. Access tokens already issued stay valid until expiry.
    pub async fn logout_everywhere(&self, user_id: UserId) -> AuthResult<u64> {
        let removed = self.ledger.delete_all_for_user(user_id).await?;
        log::info!(
            "user {} logged out everywhere ({} refresh tokens dropped)",
            user_id,
            removed
        );
        Ok(removed)
    }

    /// Verify an access token. Stateless: no ledger lookup happens here.
    pub fn authorize(&self, access_token: &str) -> AuthResult<Claims> {
        self.access_tokens.verify(access_token)
    }

    async fn resolve_user(&self, profile: &ProviderProfile) -> AuthResult<UserId> {
        if let Some(link) = self
            .identities
            .find_link_by_provider_uid(&profile.provider_user_id, &profile.provider_name)
            .await?
        {
            return Ok(link.user_id);
        }

        let user = self.identities.create_user(profile).await?;
        match self.identities.link_provider(profile, user.id).await {
            Ok(link) => {
                log::info!(
                    "created user {} for {} account {}",
                    user.id,
                    profile.provider_name,
                    profile.provider_user_id
                );
                Ok(link.user_id)
            }
            Err(AuthError::DuplicateLink) => {
                // A concurrent first login linked the account first.
                log::warn!(
                    "{} account {} was linked concurrently; user {} left unlinked",
                    profile.provider_name,
                    profile.provider_user_id,
                    user.id
                );
                self.identities
                    .find_link_by_provider_uid(&profile.provider_user_id, &profile.provider_name)
                    .await?
                    .map(|link| link.user_id)
                    .ok_or(AuthError::DuplicateLink)
            }
            Err(err) => Err(err),
        }
    }
}

fn new_record(
    user_id: UserId,
    token: &SignedToken,
    now: DateTime<Utc>,
    client: &ClientContext,
) -> NewRefreshToken {
    NewRefreshToken {
        user_id,
        token: token.token.clone(),
        issued_at: now,
        expires_at: token.expires_at,
        user_agent: client.user_agent.clone(),
        ip_address: client.ip_address.clone(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::*;
    use crate::auth::identity::IdentityStore;
    use crate::auth::memory::{InMemoryIdentityStore, InMemoryRefreshTokenLedger};
    use crate::auth::refresh_store::RefreshTokenLedger;
    use crate::test_support::{StubProvider, test_auth_config};

    struct Harness {
        state: AuthState,
        ledger: Arc<InMemoryRefreshTokenLedger>,
        identities: Arc<InMemoryIdentityStore>,
    }

    fn harness(revoke_all_on_reuse: bool) -> Harness {
        let mut config = test_auth_config();
        config.revoke_all_on_reuse = revoke_all_on_reuse;
        let ledger = Arc::new(InMemoryRefreshTokenLedger::new());
        let identities = Arc::new(InMemoryIdentityStore::new());
        let state = AuthState::new(
            config,
            ledger.clone(),
            identities.clone(),
            StubProvider::registry("u1"),
        );
        Harness {
            state,
            ledger,
            identities,
        }
    }

    fn client() -> ClientContext {
        ClientContext {
            user_agent: Some("unit-test".into()),
            ip_address: Some("127.0.0.1".into()),
        }
    }

    #[tokio::test]
    async fn login_creates_user_and_one_refresh_record() {
        let h = harness(false);

        let auth = h.state.login("yandex", "code", &client()).await.expect("login");

        assert_eq!(h.identities.user_count(), 1);
        assert_eq!(h.identities.link_count(), 1);
        assert_eq!(h.ledger.len(), 1);
        assert!(!auth.access_token.is_empty());

        let claims = h.state.authorize(&auth.access_token).expect("authorize");
        assert_eq!(claims.user_id, auth.user_id);
        assert!(!claims.is_admin);

        let record = h.ledger.find_by_token(&auth.refresh_token).await.expect("ledger row");
        assert_eq!(record.user_agent.as_deref(), Some("unit-test"));
        assert_eq!(record.ip_address.as_deref(), Some("127.0.0.1"));
    }

    #[tokio::test]
    async fn repeated_login_reuses_the_linked_user() {
        let h = harness(false);
        let first = h.state.login("yandex", "a", &client()).await.expect("first");
        let second = h.state.login("yandex", "b", &client()).await.expect("second");

        assert_eq!(first.user_id, second.user_id);
        assert_eq!(h.identities.user_count(), 1);
        assert_eq!(h.ledger.len(), 2);
    }

    #[tokio::test]
    async fn login_with_unknown_provider_fails() {
        let h = harness(false);
        let err = h
            .state
            .login("github", "code", &client())
            .await
            .expect_err("unknown provider");
        assert!(matches!(err, AuthError::UnknownProvider(_)));
        assert!(h.ledger.is_empty());
    }

    #[tokio::test]
    async fn access_tokens_are_not_refresh_tokens() {
        let h = harness(false);
        let auth = h.state.login("yandex", "code", &client()).await.expect("login");

        assert!(h.state.authorize(&auth.refresh_token).is_err());
        let err = h
            .state
            .refresh(&auth.access_token, &client())
            .await
            .expect_err("access token used for refresh");
        assert!(matches!(err, AuthError::Unauthorized));
    }

    #[tokio::test]
    async fn refresh_rotates_and_rejects_replay() {
        let h = harness(false);
        let r0 = h.state.login("yandex", "code", &client()).await.expect("login").refresh_token;

        let first = h.state.refresh(&r0, &client()).await.expect("rotate r0");
        assert_ne!(first.refresh_token, r0);
        assert!(h.state.authorize(&first.access_token).is_ok());

        let replay = h.state.refresh(&r0, &client()).await.expect_err("replay r0");
        assert!(matches!(replay, AuthError::Unauthorized));

        let second = h
            .state
            .refresh(&first.refresh_token, &client())
            .await
            .expect("rotate r1");
        assert_ne!(second.refresh_token, first.refresh_token);
        assert_eq!(h.ledger.len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_refresh_has_exactly_one_winner() {
        const RACERS: usize = 16;

        let h = harness(false);
        let r0 = h.state.login("yandex", "code", &client()).await.expect("login").refresh_token;
        let state = Arc::new(h.state.clone());

        let mut handles = Vec::with_capacity(RACERS);
        for _ in 0..RACERS {
            let state = state.clone();
            let token = r0.clone();
            handles.push(tokio::spawn(async move {
                state.refresh(&token, &ClientContext::default()).await
            }));
        }

        let mut successes = 0;
        let mut unauthorized = 0;
        for handle in handles {
            match handle.await.expect("task completes") {
                Ok(_) => successes += 1,
                Err(AuthError::Unauthorized) => unauthorized += 1,
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }

        assert_eq!(successes, 1);
        assert_eq!(unauthorized, RACERS - 1);
        // Login row plus exactly one rotation.
        assert_eq!(h.ledger.len(), 2);
    }

    #[tokio::test]
    async fn expired_refresh_tokens_are_unauthorized() {
        let h = harness(false);
        let auth = h.state.login("yandex", "code", &client()).await.expect("login");

        let later = Utc::now() + Duration::seconds(h.state.config.refresh_token_ttl_secs + 5);
        let err = h
            .state
            .refresh_at(&auth.refresh_token, &client(), later)
            .await
            .expect_err("expired");
        assert!(matches!(err, AuthError::Unauthorized));
        assert_eq!(h.ledger.len(), 1);
    }

    #[tokio::test]
    async fn refresh_picks_up_admin_changes() {
        let h = harness(false);
        let auth = h.state.login("yandex", "code", &client()).await.expect("login");
        assert!(!h.state.authorize(&auth.access_token).expect("claims").is_admin);

        h.identities
            .set_admin(auth.user_id, true)
            .await
            .expect("promote");

        let refreshed = h
            .state
            .refresh(&auth.refresh_token, &client())
            .await
            .expect("refresh");
        assert!(h.state.authorize(&refreshed.access_token).expect("claims").is_admin);
        let refresh_claims = h
            .state
            .refresh_tokens
            .verify(&refreshed.refresh_token)
            .expect("refresh claims");
        assert!(refresh_claims.is_admin);
    }

    #[tokio::test]
    async fn reuse_leaves_other_sessions_alone_by_default() {
        let h = harness(false);
        let r0 = h.state.login("yandex", "a", &client()).await.expect("login").refresh_token;
        let other = h.state.login("yandex", "b", &client()).await.expect("second device");
        h.state.refresh(&r0, &client()).await.expect("rotate");

        assert!(h.state.refresh(&r0, &client()).await.is_err());
        assert!(h.state.refresh(&other.refresh_token, &client()).await.is_ok());
    }

    #[tokio::test]
    async fn reuse_revokes_every_session_when_enabled() {
        let h = harness(true);
        let r0 = h.state.login("yandex", "a", &client()).await.expect("login").refresh_token;
        let other = h.state.login("yandex", "b", &client()).await.expect("second device");
        let rotated = h.state.refresh(&r0, &client()).await.expect("rotate");

        assert!(h.state.refresh(&r0, &client()).await.is_err());

        assert!(h.state.refresh(&other.refresh_token, &client()).await.is_err());
        assert!(h.state.refresh(&rotated.refresh_token, &client()).await.is_err());
        assert!(h.ledger.is_empty());
    }

    #[tokio::test]
    async fn reuse_is_still_detected_after_ledger_cleanup() {
        let h = harness(true);
        let r0 = h.state.login("yandex", "a", &client()).await.expect("login").refresh_token;
        let other = h.state.login("yandex", "b", &client()).await.expect("second device");
        h.state.refresh(&r0, &client()).await.expect("rotate");

        let removed = h.ledger.cleanup_expired(Utc::now()).await.expect("cleanup");
        assert_eq!(removed, 0);

        assert!(h.state.refresh(&r0, &client()).await.is_err());
        assert!(h.state.refresh(&other.refresh_token, &client()).await.is_err());
        assert!(h.ledger.is_empty());
    }

    #[tokio::test]
    async fn logout_revokes_the_presented_token() {
        let h = harness(false);
        let auth = h.state.login("yandex", "code", &client()).await.expect("login");

        h.state
            .logout(Some(&auth.refresh_token))
            .await
            .expect("logout");
        assert!(h.state.refresh(&auth.refresh_token, &client()).await.is_err());

        h.state.logout(None).await.expect("logout without cookie");
        h.state
            .logout(Some("not-a-token"))
            .await
            .expect("logout with unknown token");
    }

    #[tokio::test]
    async fn logout_everywhere_drops_all_user_tokens() {
        let h = harness(false);
        let first = h.state.login("yandex", "a", &client()).await.expect("first");
        let second = h.state.login("yandex", "b", &client()).await.expect("second");

        let removed = h
            .state
            .logout_everywhere(first.user_id)
            .await
            .expect("logout everywhere");
        assert_eq!(removed, 2);

        assert!(h.ledger.records_for_user(first.user_id).is_empty());
        assert!(h.state.refresh(&second.refresh_token, &client()).await.is_err());
    }
}
