use sigcore::{EnvelopeError, ParamsError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("Invalid IP address: {0}")]
    InvalidAddress(String),

    #[error("{0}")]
    Params(#[from] ParamsError),

    #[error("Invalid message: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Room connection error: {0}")]
    Http(String),

    #[error("HTTP {method} to {url} error: {reason}")]
    Request {
        method: String,
        url: String,
        reason: String,
    },

    #[error("Non-200 response to {method} to URL: {url} : {status}")]
    Status {
        method: String,
        url: String,
        status: u16,
    },
}

pub type Result<T> = std::result::Result<T, SignalingError>;
