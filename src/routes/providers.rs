use rocket::serde::json::Json;
use rocket::{State, get};

use crate::auth::AuthState;
use crate::auth::providers::ProviderDescriptor;
use crate::models::ApiResponse;

/// Client-side settings for every registered identity provider.
#[get("/providers")]
pub fn list_providers(state: &State<AuthState>) -> Json<ApiResponse<Vec<ProviderDescriptor>>> {
    Json(ApiResponse::new(state.providers.descriptors()))
}
