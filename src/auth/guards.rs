use rocket::State;
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};

use crate::auth::claims::UserId;
use crate::auth::session::ClientContext;
use crate::auth::{AuthError, AuthResult, AuthState};

/// Identity of the caller, established from a verified access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: UserId,
    pub is_admin: bool,
}

/// Outcome of the gate for one request. Computed at most once; later guards
/// and the request logger read the cached value.
struct GateDecision(Option<Result<AuthUser, Status>>);

/// The caller admitted by the gate on this request, if any.
pub fn authenticated_user(request: &Request<'_>) -> Option<AuthUser> {
    request
        .local_cache(|| GateDecision(None))
        .0
        .and_then(|decision| decision.ok())
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AuthUser {
    type Error = AuthError;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let cached = request
            .local_cache_async(async { GateDecision(Some(authenticate(request).await)) })
            .await;
        let decision = match cached.0 {
            Some(decision) => decision,
            None => authenticate(request).await,
        };

        match decision {
            Ok(user) => Outcome::Success(user),
            Err(status) if status == Status::Unauthorized => {
                Outcome::Error((status, AuthError::Unauthorized))
            }
            Err(status) => Outcome::Error((
                status,
                AuthError::Config("authorization gate unavailable".into()),
            )),
        }
    }
}

async fn authenticate(request: &Request<'_>) -> Result<AuthUser, Status> {
    extract_user(request).await.map_err(|err| {
        log::debug!("{} {} rejected: {}", request.method(), request.uri(), err);
        err.into_opaque().status()
    })
}

#[derive(Debug, Clone, Copy)]
pub struct RequireAdmin(pub AuthUser);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for RequireAdmin {
    type Error = AuthError;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match AuthUser::from_request(request).await {
            Outcome::Success(user) => {
                if user.is_admin {
                    Outcome::Success(RequireAdmin(user))
                } else {
                    Outcome::Error((Status::Forbidden, AuthError::Forbidden))
                }
            }
            Outcome::Error(err) => Outcome::Error(err),
            Outcome::Forward(_) => Outcome::Error((Status::Unauthorized, AuthError::Unauthorized)),
        }
    }
}

/// Provenance of the calling client, recorded alongside refresh tokens.
#[rocket::async_trait]
impl<'r> FromRequest<'r> for ClientContext {
    type Error = std::convert::Infallible;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        Outcome::Success(ClientContext {
            user_agent: request.headers().get_one("User-Agent").map(str::to_string),
            ip_address: request.client_ip().map(|ip| ip.to_string()),
        })
    }
}

async fn extract_user(request: &Request<'_>) -> AuthResult<AuthUser> {
    let token = bearer_token_from_request(request)?;

    let auth_state = request
        .guard::<&State<AuthState>>()
        .await
        .succeeded()
        .ok_or_else(|| AuthError::Config("AuthState missing from state".into()))?;

    let claims = auth_state.authorize(token)?;

    Ok(AuthUser {
        user_id: claims.user_id,
        is_admin: claims.is_admin,
    })
}

fn bearer_token_from_request<'a>(request: &'a Request<'_>) -> AuthResult<&'a str> {
    let header = request
        .headers()
        .get_one("Authorization")
        .ok_or(AuthError::MissingCredential)?;
    parse_bearer(header)
}

fn parse_bearer(header: &str) -> AuthResult<&str> {
    let mut parts = header.trim().splitn(2, ' ');
    let scheme = parts.next().unwrap_or_default();
    let token = parts.next().unwrap_or_default().trim();
    if scheme.eq_ignore_ascii_case("Bearer") && !token.is_empty() {
        Ok(token)
    } else {
        Err(AuthError::MissingCredential)
    }
}
