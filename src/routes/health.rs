//! Lightweight liveness endpoint used for readiness checks and tests.

use rocket::get;
use rocket::serde::json::Json;
use serde::{Deserialize, Serialize};

use crate::models::ApiResponse;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[get("/ping")]
pub fn ping() -> Json<ApiResponse<HealthResponse>> {
    Json(ApiResponse::new(HealthResponse {
        status: "ok".to_string(),
    }))
}
