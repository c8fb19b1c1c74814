//! Binary-crate error type: wraps [`conductor_core::Error`] plus the I/O
//! failure modes the kernel's infrastructure layer introduces.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] conductor_core::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    #[must_use]
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config(reason.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
