pub mod auth;
pub mod message;
pub mod presence;
pub mod user;

use thiserror::Error;

/// Service-level failures the API layer translates into status codes.
/// Everything not worth a named variant travels as a store error.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    BadInput(&'static str),

    #[error("username already exists")]
    UsernameTaken,

    #[error("contact already exists")]
    DuplicateContact,

    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
