use chrono::{DateTime, Utc};
use rocket_db_pools::sqlx::FromRow;
use serde::{Deserialize, Serialize};

use crate::auth::claims::UserId;

// ===== Identity Models =====

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

/// Binding between an external provider account and an internal user.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq, Eq)]
pub struct ProviderLink {
    pub user_id: UserId,
    pub provider: String,
    pub provider_uid: String,
    pub name: String,
}

// ===== API Payloads =====

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self { data }
    }
}
