use std::time::Duration;

use reqwest::StatusCode;
use shared::error::ErrorCode;
use thiserror::Error;

use crate::message::OutgoingMessage;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("message text must not be empty")]
    EmptyMessage,
    #[error("image messages must reference an uploaded resource")]
    InvalidMedia,
    #[error("api request failed with status {status}: {code:?}: {message}")]
    Api {
        status: StatusCode,
        code: ErrorCode,
        message: String,
    },
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("realtime channel is not running")]
    NotConnected,
    #[error("no response to send within {0:?}")]
    SendTimeout(Duration),
}

/// A send that did not reach the backend. The pending record is already gone
/// from the timeline; `draft` is what goes back into the input field.
#[derive(Debug, Error)]
#[error("failed to send message: {source}")]
pub struct SendFailure {
    pub draft: OutgoingMessage,
    #[source]
    pub source: anyhow::Error,
}
