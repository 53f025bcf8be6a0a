use rocket::serde::json::Json;
use rocket::{State, get, put};
use serde::{Deserialize, Serialize};

use crate::auth::claims::UserId;
use crate::auth::{AuthState, AuthUser, RequireAdmin};
use crate::error::ApiError;
use crate::models::{ApiResponse, User};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetAdminRequest {
    pub is_admin: bool,
}

/// The caller's own user record.
#[get("/user")]
pub async fn current_user(
    state: &State<AuthState>,
    user: AuthUser,
) -> Result<Json<ApiResponse<User>>, ApiError> {
    let record = state.identities.get_user(user.user_id).await?;
    Ok(Json(ApiResponse::new(record)))
}

/// Grant or revoke admin rights. Takes effect at the target's next login or
/// refresh; access tokens already issued keep their claims until expiry.
#[put("/admin/users/<user_id>/admin", data = "<payload>")]
pub async fn set_admin(
    state: &State<AuthState>,
    admin: RequireAdmin,
    user_id: UserId,
    payload: Json<SetAdminRequest>,
) -> Result<Json<ApiResponse<User>>, ApiError> {
    let updated = state
        .identities
        .set_admin(user_id, payload.is_admin)
        .await?;
    log::info!(
        "user {} set is_admin={} on user {}",
        admin.0.user_id,
        updated.is_admin,
        updated.id
    );
    Ok(Json(ApiResponse::new(updated)))
}
