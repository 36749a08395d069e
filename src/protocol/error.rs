use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Message is not valid UTF-8")]
    InvalidEncoding,

    #[error("Missing segment at index {0}")]
    MissingSegment(usize),

    #[error("Missing field {index} in {segment} segment")]
    MissingField { segment: &'static str, index: usize },

    #[error("Invalid numeric value in {segment} field {index}: {value}")]
    InvalidNumber {
        segment: &'static str,
        index: usize,
        value: String,
    },

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Invalid sex code: {0}")]
    InvalidSexCode(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
