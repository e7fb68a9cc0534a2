//! Error types shared by the client, the async bridge and polling tasks.
//!
//! # Design
//! `ApiError` is `Clone` because a single final result may be handed to any
//! number of observers. Opaque transport failures are therefore held behind
//! an `Arc` rather than a `Box`.
//!
//! `NotFound` gets a dedicated variant because callers frequently distinguish
//! "the resource does not exist" from "the server returned an unexpected
//! status." All other non-2xx responses land in `HttpStatus` with the raw
//! status code and body for debugging.

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by every operation in this crate.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// The transport failed before a response was received.
    #[error("transport error: {0}")]
    Transport(Arc<dyn StdError + Send + Sync>),

    /// The server returned 404.
    #[error("resource not found")]
    NotFound,

    /// The server returned a non-2xx status other than 404.
    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// The response body could not be decoded into the expected type.
    #[error("decoding failed: {0}")]
    Decoding(String),

    /// The request parameters could not be encoded.
    #[error("encoding failed: {0}")]
    Encoding(String),

    /// The operation, or whoever was waiting for it, was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// A polling coordinator could not build its check request.
    #[error("coordinator error: {0}")]
    Coordinator(String),

    /// A polling task ran past its overall timeout.
    #[error("task timed out after {0:?}")]
    TimedOut(Duration),
}

impl ApiError {
    /// Wrap any error as an opaque transport failure.
    pub fn transport<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        ApiError::Transport(Arc::new(error))
    }

    /// Whether this error means the operation was cancelled rather than failed.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ApiError::Cancelled)
    }

    /// The HTTP status behind this error, if there was one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::NotFound => Some(404),
            ApiError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}
