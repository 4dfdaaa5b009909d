use thiserror::Error;

use crate::crypto::CryptoError;

#[derive(Error, Debug)]
pub enum IptvError {
    #[error("http error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status code: {0}")]
    Status(u16),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("request cancelled")]
    Cancelled,
}

impl From<serde_json::Error> for IptvError {
    fn from(e: serde_json::Error) -> Self {
        IptvError::Parse(format!("json: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, IptvError>;
