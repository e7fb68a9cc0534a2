//! The boundary to whatever actually performs network I/O.
//!
//! # Design
//! A `Transport` receives a `ResolvedRequest`, returns a cancellable handle
//! right away and later invokes its completion exactly once: with the raw
//! response, with a transport failure, or with `ApiError::Cancelled` when
//! the handle was cancelled first. Everything above this trait relies on
//! that single-callback guarantee.

use std::sync::Arc;

use crate::error::ApiError;
use crate::http::{HttpResponse, Progress};
use crate::resolve::ResolvedRequest;

/// Completion callback handed to a transport.
pub type TransportCompletion = Box<dyn FnOnce(Result<HttpResponse, ApiError>) + Send + 'static>;

/// Executes resolved requests.
///
/// The completion may run on any thread, including inline before `execute`
/// returns. Inline completion is allowed but leaves the request without
/// upload and download figures in its `TaskMetrics`.
pub trait Transport: Send + Sync + 'static {
    fn execute(&self, request: ResolvedRequest, completion: TransportCompletion) -> Arc<dyn RequestHandle>;
}

/// A live request. `cancel` must be safe to call any number of times from
/// any thread and must not block.
pub trait RequestHandle: Send + Sync {
    fn cancel(&self);

    fn upload_progress(&self) -> Progress {
        Progress::default()
    }

    fn download_progress(&self) -> Progress {
        Progress::default()
    }
}

/// Handle for work that has nothing left to cancel.
#[derive(Debug, Default, Clone, Copy)]
pub struct FinishedHandle;

impl RequestHandle for FinishedHandle {
    fn cancel(&self) {}
}
