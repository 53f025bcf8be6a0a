use chrono::{DateTime, Utc};
use rocket::http::{Cookie, CookieJar, Status};
use rocket::serde::json::Json;
use rocket::{State, get, post};
use serde::{Deserialize, Serialize};
use time::Duration as TimeDuration;

use crate::auth::claims::{AuthData, UserId};
use crate::auth::session::ClientContext;
use crate::auth::{AuthError, AuthState, AuthUser};

const REFRESH_COOKIE_PATH: &str = "/api/user";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub provider_key: String,
    pub authorization_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub user_id: UserId,
}

type AuthRouteResult<T> = Result<Json<T>, AuthError>;

#[post("/user/login", data = "<payload>")]
pub async fn login(
    state: &State<AuthState>,
    cookies: &CookieJar<'_>,
    client: ClientContext,
    payload: Json<LoginRequest>,
) -> AuthRouteResult<TokenResponse> {
    let provider_key = payload.provider_key.trim();
    let code = payload.authorization_code.trim();
    if provider_key.is_empty() || code.is_empty() {
        return Err(AuthError::ProviderRejected(
            "provider_key and authorization_code are required".into(),
        ));
    }

    let auth = state.login(provider_key, code, &client).await?;
    Ok(Json(issue_session(cookies, state, auth)))
}

#[post("/user/refresh")]
pub async fn refresh(
    state: &State<AuthState>,
    cookies: &CookieJar<'_>,
    client: ClientContext,
) -> AuthRouteResult<TokenResponse> {
    let refresh_cookie = match cookies.get(&state.config.refresh_cookie_name) {
        Some(cookie) => cookie.value().to_string(),
        None => return Err(AuthError::Unauthorized),
    };

    let auth = state.refresh(&refresh_cookie, &client).await?;
    Ok(Json(issue_session(cookies, state, auth)))
}

#[get("/user/logout")]
pub async fn logout(state: &State<AuthState>, cookies: &CookieJar<'_>) -> Status {
    let refresh_cookie = cookies
        .get(&state.config.refresh_cookie_name)
        .map(|cookie| cookie.value().to_string());

    // Logout always clears the client side, even if revocation fails.
    if let Err(err) = state.logout(refresh_cookie.as_deref()).await {
        log::warn!("failed to revoke refresh token on logout: {}", err);
    }

    clear_refresh_cookie(cookies, state);
    Status::NoContent
}

/// Drop every refresh token of the caller. Needs the bearer access token, so a
/// cross-site navigation carrying only the cookie cannot trigger it.
#[post("/user/logout/all")]
pub async fn logout_everywhere(
    state: &State<AuthState>,
    cookies: &CookieJar<'_>,
    user: AuthUser,
) -> Result<Status, AuthError> {
    state.logout_everywhere(user.user_id).await?;
    clear_refresh_cookie(cookies, state);
    Ok(Status::NoContent)
}

fn issue_session(cookies: &CookieJar<'_>, state: &AuthState, auth: AuthData) -> TokenResponse {
    set_refresh_cookie(cookies, state, &auth.refresh_token, auth.refresh_expires_at);
    TokenResponse {
        access_token: auth.access_token,
        user_id: auth.user_id,
    }
}

fn set_refresh_cookie(
    cookies: &CookieJar<'_>,
    state: &AuthState,
    token: &str,
    expires_at: DateTime<Utc>,
) {
    let max_age_secs = (expires_at - Utc::now()).num_seconds().max(0);
    let mut cookie = Cookie::build((state.config.refresh_cookie_name.clone(), token.to_string()))
        .path(REFRESH_COOKIE_PATH)
        .http_only(true)
        .same_site(state.config.cookie_same_site)
        .secure(state.config.cookie_secure)
        .max_age(TimeDuration::seconds(max_age_secs))
        .build();

    if let Some(domain) = &state.config.cookie_domain {
        cookie.set_domain(domain.clone());
    }

    cookies.add(cookie);
}

fn clear_refresh_cookie(cookies: &CookieJar<'_>, state: &AuthState) {
    let mut cookie = Cookie::build((state.config.refresh_cookie_name.clone(), String::new()))
        .path(REFRESH_COOKIE_PATH)
        .build();

    if let Some(domain) = &state.config.cookie_domain {
        cookie.set_domain(domain.clone());
    }

    cookies.remove(cookie);
}
