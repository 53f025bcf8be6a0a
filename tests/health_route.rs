use codekata_api::models::ApiResponse;
use codekata_api::routes::health::{HealthResponse, ping};
use codekata_api::test_support::TestRocketBuilder;
use rocket::http::Status;
use rocket::routes;

#[test]
fn ping_returns_ok_without_credentials() {
    let client = TestRocketBuilder::new()
        .mount_api_routes(routes![ping])
        .blocking_client();

    let response = client.get("/api/ping").dispatch();
    assert_eq!(response.status(), Status::Ok);

    let payload: ApiResponse<HealthResponse> = response.into_json().expect("valid JSON payload");
    assert_eq!(payload.data.status, "ok");
}
