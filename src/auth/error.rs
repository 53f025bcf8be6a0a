use std::io::Cursor;

use rocket::http::{ContentType, Status};
use rocket::response::{self, Responder};
use rocket::{Request, Response};
use thiserror::Error;

use crate::auth::claims::UserId;

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token signature invalid")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("token kind mismatch")]
    WrongKind,
    #[error("refresh token not found")]
    NotFound,
    #[error("refresh token revoked")]
    Revoked { user_id: UserId },
    #[error("refresh token already recorded")]
    DuplicateToken,
    #[error("authorization credential missing")]
    MissingCredential,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("unknown identity provider: {0}")]
    UnknownProvider(String),
    #[error("identity provider rejected the authorization code: {0}")]
    ProviderRejected(String),
    #[error("user {0} not found")]
    UserNotFound(UserId),
    #[error("provider link already exists")]
    DuplicateLink,
    #[error("configuration error: {0}")]
    Config(String),
    #[error("token signing error: {0}")]
    Signing(String),
    #[error("database error: {0}")]
    Sqlx(#[from] rocket_db_pools::sqlx::Error),
    #[error("identity provider request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl AuthError {
    pub fn status(&self) -> Status {
        match self {
            AuthError::InvalidSignature
            | AuthError::Expired
            | AuthError::WrongKind
            | AuthError::NotFound
            | AuthError::Revoked { .. }
            | AuthError::MissingCredential
            | AuthError::Unauthorized
            | AuthError::ProviderRejected(_) => Status::Unauthorized,
            AuthError::Forbidden => Status::Forbidden,
            AuthError::UnknownProvider(_) => Status::BadRequest,
            AuthError::UserNotFound(_) => Status::NotFound,
            AuthError::DuplicateToken
            | AuthError::DuplicateLink
            | AuthError::Config(_)
            | AuthError::Signing(_)
            | AuthError::Sqlx(_) => Status::InternalServerError,
            AuthError::Http(_) => Status::BadGateway,
        }
    }

    /// True for failures that describe the presented credential rather than
    /// the infrastructure behind it.
    pub fn is_credential_failure(&self) -> bool {
        matches!(
            self,
            AuthError::InvalidSignature
                | AuthError::Expired
                | AuthError::WrongKind
                | AuthError::NotFound
                | AuthError::Revoked { .. }
                | AuthError::DuplicateToken
                | AuthError::MissingCredential
                | AuthError::UserNotFound(_)
                | AuthError::Unauthorized
        )
    }

    /// Collapse credential failures into `Unauthorized` so clients cannot tell
    /// an expired token from a replayed or forged one. Infrastructure errors
    /// pass through unchanged.
    pub fn into_opaque(self) -> AuthError {
        if matches!(self, AuthError::Unauthorized) {
            return self;
        }
        if self.is_credential_failure() {
            match &self {
                AuthError::DuplicateToken => log::error!("refresh ledger invariant violated: {}", self),
                _ => log::debug!("credential rejected: {}", self),
            }
            AuthError::Unauthorized
        } else {
            self
        }
    }

    fn public_message(&self) -> String {
        match self.status().code {
            401 => "unauthorized".to_string(),
            500 => "internal server error".to_string(),
            502 => "identity provider unavailable".to_string(),
            _ => self.to_string(),
        }
    }
}

impl<'r> Responder<'r, 'static> for AuthError {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'static> {
        let status = self.status();
        if status.code >= 500 {
            log::error!("auth request failed: {}", self);
        } else {
            log::debug!("auth request rejected: {}", self);
        }

        let body = self.public_message();
        Response::build()
            .status(status)
            .header(ContentType::Plain)
            .sized_body(body.len(), Cursor::new(body))
            .ok()
    }
}

pub(crate) fn is_unique_violation(err: &rocket_db_pools::sqlx::Error) -> bool {
    matches!(
        err,
        rocket_db_pools::sqlx::Error::Database(db_err)
            if db_err.code().as_deref() == Some("23505")
    )
}
