use thiserror::Error;

use crate::auth::AuthError;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("no one is publishing to path '{0}'")]
    NoStreamAvailable(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("terminated")]
    Terminated,
}

impl Error {
    /// Whether the caller may retry the same request later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NoStreamAvailable(_) | Self::Conflict(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
