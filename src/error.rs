use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("History bootstrap error: {0}")]
    Bootstrap(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::protocol::error::ProtocolError),

    #[error("Pager error: {0}")]
    Pager(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Database(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
