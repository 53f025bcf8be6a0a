use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{Duration, Utc};
use codekata_api::auth::{AuthState, AuthUser, RequireAdmin};
use codekata_api::in_memory_auth_state;
use codekata_api::test_support::{StubProvider, TestRocketBuilder, test_auth_config};
use rocket::http::{Header, Status};
use rocket::local::blocking::Client;
use rocket::{State, get, routes};

#[derive(Default)]
struct HitCounter(AtomicUsize);

#[get("/protected")]
fn protected(user: AuthUser, hits: &State<HitCounter>) -> String {
    hits.0.fetch_add(1, Ordering::SeqCst);
    format!("{}:{}", user.user_id, user.is_admin)
}

#[get("/admin-only")]
fn admin_only(admin: RequireAdmin, hits: &State<HitCounter>) -> String {
    hits.0.fetch_add(1, Ordering::SeqCst);
    admin.0.user_id.to_string()
}

fn setup() -> (Client, AuthState) {
    let state = in_memory_auth_state(test_auth_config(), StubProvider::registry("u1"));
    let rocket = TestRocketBuilder::new()
        .mount_api_routes(routes![protected, admin_only])
        .manage_auth_state(state.clone())
        .build()
        .manage(HitCounter::default());
    let client = Client::untracked(rocket).expect("valid Rocket instance");
    (client, state)
}

fn hits(client: &Client) -> usize {
    client
        .rocket()
        .state::<HitCounter>()
        .expect("counter managed")
        .0
        .load(Ordering::SeqCst)
}

fn bearer(token: &str) -> Header<'static> {
    Header::new("Authorization", format!("Bearer {token}"))
}

#[test]
fn missing_header_is_rejected_before_the_handler() {
    let (client, _) = setup();

    let response = client.get("/api/protected").dispatch();
    assert_eq!(response.status(), Status::Unauthorized);
    assert_eq!(response.into_string().as_deref(), Some("unauthorized"));
    assert_eq!(hits(&client), 0);
}

#[test]
fn malformed_and_forged_tokens_are_rejected() {
    let (client, state) = setup();
    let refresh = state.refresh_tokens.issue(1, false).expect("refresh token");

    for header in [
        Header::new("Authorization", "Basic dXNlcjpwYXNz"),
        Header::new("Authorization", "Bearer"),
        bearer("not-a-jwt"),
        bearer(&refresh.token),
    ] {
        let response = client.get("/api/protected").header(header).dispatch();
        assert_eq!(response.status(), Status::Unauthorized);
        assert_eq!(response.into_string().as_deref(), Some("unauthorized"));
    }
    assert_eq!(hits(&client), 0);
}

#[test]
fn expired_access_tokens_are_rejected() {
    let (client, state) = setup();
    let issued = Utc::now() - Duration::seconds(state.config.access_token_ttl_secs + 10);
    let stale = state
        .access_tokens
        .issue_at(5, false, issued)
        .expect("access token");

    let response = client
        .get("/api/protected")
        .header(bearer(&stale.token))
        .dispatch();
    assert_eq!(response.status(), Status::Unauthorized);
    assert_eq!(hits(&client), 0);
}

#[test]
fn valid_access_token_reaches_the_handler_with_its_identity() {
    let (client, state) = setup();
    let access = state.access_tokens.issue(42, true).expect("access token");

    let response = client
        .get("/api/protected")
        .header(bearer(&access.token))
        .dispatch();
    assert_eq!(response.status(), Status::Ok);
    assert_eq!(response.into_string().as_deref(), Some("42:true"));
    assert_eq!(hits(&client), 1);
}

#[test]
fn admin_routes_require_the_admin_claim() {
    let (client, state) = setup();
    let user = state.access_tokens.issue(7, false).expect("user token");
    let admin = state.access_tokens.issue(8, true).expect("admin token");

    let response = client
        .get("/api/admin-only")
        .header(bearer(&user.token))
        .dispatch();
    assert_eq!(response.status(), Status::Forbidden);
    assert_eq!(response.into_string().as_deref(), Some("forbidden"));
    assert_eq!(hits(&client), 0);

    let response = client.get("/api/admin-only").dispatch();
    assert_eq!(response.status(), Status::Unauthorized);

    let response = client
        .get("/api/admin-only")
        .header(bearer(&admin.token))
        .dispatch();
    assert_eq!(response.status(), Status::Ok);
    assert_eq!(response.into_string().as_deref(), Some("8"));
    assert_eq!(hits(&client), 1);
}
