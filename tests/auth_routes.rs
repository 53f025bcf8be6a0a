use codekata_api::auth::routes::TokenResponse;
use codekata_api::auth::AuthState;
use codekata_api::models::{ApiResponse, User};
use codekata_api::test_support::{StubProvider, TestRocketBuilder, test_auth_config};
use codekata_api::{api_routes, in_memory_auth_state};
use rocket::http::{ContentType, Cookie, Header, Status};
use rocket::local::blocking::{Client, LocalResponse};
use rocket::serde::json::json;

const COOKIE: &str = "codekata_refresh";

fn setup() -> (Client, AuthState) {
    let state = in_memory_auth_state(test_auth_config(), StubProvider::registry("u1"));
    let rocket = TestRocketBuilder::new()
        .mount_api_routes(api_routes())
        .manage_auth_state(state.clone())
        .build();
    let client = Client::untracked(rocket).expect("valid Rocket instance");
    (client, state)
}

fn refresh_cookie(response: &LocalResponse<'_>) -> String {
    response
        .cookies()
        .get(COOKIE)
        .map(|cookie| cookie.value().to_string())
        .expect("refresh cookie set")
}

fn login(client: &Client, code: &str) -> (TokenResponse, String) {
    let response = client
        .post("/api/user/login")
        .header(ContentType::JSON)
        .body(json!({"provider_key": "yandex", "authorization_code": code}).to_string())
        .dispatch();
    assert_eq!(response.status(), Status::Ok);
    let refresh = refresh_cookie(&response);
    let tokens: TokenResponse = response.into_json().expect("token payload");
    (tokens, refresh)
}

fn refresh<'c>(client: &'c Client, token: &str) -> LocalResponse<'c> {
    client
        .post("/api/user/refresh")
        .cookie(Cookie::new(COOKIE, token.to_string()))
        .dispatch()
}

fn bearer(token: &str) -> Header<'static> {
    Header::new("Authorization", format!("Bearer {token}"))
}

#[test]
fn login_sets_an_http_only_refresh_cookie() {
    let (client, _) = setup();
    let response = client
        .post("/api/user/login")
        .header(ContentType::JSON)
        .body(json!({"provider_key": "yandex", "authorization_code": "code"}).to_string())
        .dispatch();
    assert_eq!(response.status(), Status::Ok);

    let cookie = response.cookies().get(COOKIE).expect("refresh cookie").clone();
    assert_eq!(cookie.http_only(), Some(true));
    assert_eq!(cookie.path(), Some("/api/user"));
    assert!(cookie.max_age().is_some());

    let tokens: TokenResponse = response.into_json().expect("token payload");
    assert!(!tokens.access_token.is_empty());
    assert_ne!(tokens.access_token, cookie.value());
}

#[test]
fn login_failures_map_to_statuses() {
    let (client, _) = setup();

    let response = client
        .post("/api/user/login")
        .header(ContentType::JSON)
        .body(json!({"provider_key": "github", "authorization_code": "code"}).to_string())
        .dispatch();
    assert_eq!(response.status(), Status::BadRequest);

    let response = client
        .post("/api/user/login")
        .header(ContentType::JSON)
        .body(json!({"provider_key": "yandex", "authorization_code": "rejected"}).to_string())
        .dispatch();
    assert_eq!(response.status(), Status::Unauthorized);
}

#[test]
fn access_token_opens_the_current_user_route() {
    let (client, _) = setup();
    let (tokens, _) = login(&client, "code");

    let response = client.get("/api/user").header(bearer(&tokens.access_token)).dispatch();
    assert_eq!(response.status(), Status::Ok);
    let payload: ApiResponse<User> = response.into_json().expect("user payload");
    assert_eq!(payload.data.id, tokens.user_id);
    assert_eq!(payload.data.name, "User u1");

    let response = client.get("/api/user").dispatch();
    assert_eq!(response.status(), Status::Unauthorized);
}

#[test]
fn refresh_rotates_the_cookie_and_rejects_replay() {
    let (client, _) = setup();
    let (_, r0) = login(&client, "code");

    let response = refresh(&client, &r0);
    assert_eq!(response.status(), Status::Ok);
    let r1 = refresh_cookie(&response);
    assert_ne!(r1, r0);
    let tokens: TokenResponse = response.into_json().expect("token payload");
    let response = client.get("/api/user").header(bearer(&tokens.access_token)).dispatch();
    assert_eq!(response.status(), Status::Ok);

    let replay = refresh(&client, &r0);
    assert_eq!(replay.status(), Status::Unauthorized);
    assert_eq!(replay.into_string().as_deref(), Some("unauthorized"));

    assert_eq!(refresh(&client, &r1).status(), Status::Ok);
}

#[test]
fn refresh_without_cookie_or_with_garbage_is_unauthorized() {
    let (client, _) = setup();

    let response = client.post("/api/user/refresh").dispatch();
    assert_eq!(response.status(), Status::Unauthorized);

    assert_eq!(refresh(&client, "garbage").status(), Status::Unauthorized);
}

#[test]
fn logout_clears_the_cookie_and_revokes_the_token() {
    let (client, _) = setup();
    let (_, r0) = login(&client, "code");

    let response = client
        .get("/api/user/logout")
        .cookie(Cookie::new(COOKIE, r0.clone()))
        .dispatch();
    assert_eq!(response.status(), Status::NoContent);
    let cleared = response.cookies().get(COOKIE).map(|cookie| cookie.value().to_string());
    assert_eq!(cleared.as_deref(), Some(""));

    assert_eq!(refresh(&client, &r0).status(), Status::Unauthorized);

    let response = client.get("/api/user/logout").dispatch();
    assert_eq!(response.status(), Status::NoContent);
}

#[test]
fn logout_everywhere_ends_every_session() {
    let (client, _) = setup();
    let (laptop_tokens, laptop) = login(&client, "a");
    let (_, phone) = login(&client, "b");

    let response = client
        .post("/api/user/logout/all")
        .header(bearer(&laptop_tokens.access_token))
        .dispatch();
    assert_eq!(response.status(), Status::NoContent);

    assert_eq!(refresh(&client, &laptop).status(), Status::Unauthorized);
    assert_eq!(refresh(&client, &phone).status(), Status::Unauthorized);
}

#[test]
fn logout_everywhere_needs_the_access_token() {
    let (client, _) = setup();
    let (_, laptop) = login(&client, "a");

    // The cookie alone, as a cross-site request would carry it.
    let response = client
        .post("/api/user/logout/all")
        .cookie(Cookie::new(COOKIE, laptop.clone()))
        .dispatch();
    assert_eq!(response.status(), Status::Unauthorized);

    let response = client
        .get("/api/user/logout?all=true")
        .cookie(Cookie::new(COOKIE, "unrelated"))
        .dispatch();
    assert_eq!(response.status(), Status::NoContent);

    assert_eq!(refresh(&client, &laptop).status(), Status::Ok);
}

#[test]
fn providers_are_listed_publicly() {
    let (client, _) = setup();

    let response = client.get("/api/providers").dispatch();
    assert_eq!(response.status(), Status::Ok);
    let body = response.into_string().expect("body");
    assert!(body.contains("\"provider\":\"yandex\""));
    assert!(body.contains("stub-client"));
}

#[test]
fn admin_rights_apply_from_the_next_refresh() {
    let (client, state) = setup();
    let (admin_tokens, admin_refresh) = login(&client, "code");

    let response = client
        .put(format!("/api/admin/users/{}/admin", admin_tokens.user_id))
        .header(ContentType::JSON)
        .header(bearer(&admin_tokens.access_token))
        .body(json!({"is_admin": true}).to_string())
        .dispatch();
    assert_eq!(response.status(), Status::Forbidden);

    tokio::runtime::Runtime::new()
        .expect("runtime")
        .block_on(state.identities.set_admin(admin_tokens.user_id, true))
        .expect("promote");

    // The old access token keeps its snapshot of the admin flag.
    let response = client
        .put(format!("/api/admin/users/{}/admin", admin_tokens.user_id))
        .header(ContentType::JSON)
        .header(bearer(&admin_tokens.access_token))
        .body(json!({"is_admin": true}).to_string())
        .dispatch();
    assert_eq!(response.status(), Status::Forbidden);

    let response = refresh(&client, &admin_refresh);
    assert_eq!(response.status(), Status::Ok);
    let refreshed: TokenResponse = response.into_json().expect("token payload");

    let response = client
        .put(format!("/api/admin/users/{}/admin", admin_tokens.user_id))
        .header(ContentType::JSON)
        .header(bearer(&refreshed.access_token))
        .body(json!({"is_admin": false}).to_string())
        .dispatch();
    assert_eq!(response.status(), Status::Ok);
    let payload: ApiResponse<User> = response.into_json().expect("user payload");
    assert!(!payload.data.is_admin);

    let response = client
        .put("/api/admin/users/999/admin")
        .header(ContentType::JSON)
        .header(bearer(&refreshed.access_token))
        .body(json!({"is_admin": true}).to_string())
        .dispatch();
    assert_eq!(response.status(), Status::NotFound);
}
