//! Awaitable, multi-observer view of a single callback-based request.
//!
//! # Design
//! A `CompletionCell` is written exactly once and read any number of times.
//! Observers attached before completion are queued and notified in
//! registration order when the result arrives; observers attached afterwards
//! are notified immediately. Callbacks never run while the cell's lock is
//! held, and observers attached during a flush join the back of the queue so
//! the ordering guarantee still holds.
//!
//! Cancellation is cooperative. `AsyncRequest::cancel`, a cancelled
//! `CancellationToken`, or dropping a `ResponseFuture` that was already
//! being awaited all forward one cancel to the transport handle; the final
//! result still comes from the transport's own callback. The only result the
//! bridge fabricates is the immediate `Cancelled` for a token that was
//! already cancelled before anything was dispatched.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use parking_lot::{Mutex, MutexGuard};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::client::ApiClient;
use crate::error::ApiError;
use crate::http::Progress;
use crate::request::ApiRequest;
use crate::transport::{FinishedHandle, RequestHandle};

/// Callback notified with the final result of a completion cell.
pub type Observer<T> = Box<dyn FnOnce(Result<T, ApiError>) + Send + 'static>;

struct CellState<T> {
    result: Option<Result<T, ApiError>>,
    observers: VecDeque<Observer<T>>,
    flushing: bool,
}

/// Single-assignment result slot with queued observers.
pub struct CompletionCell<T> {
    state: Mutex<CellState<T>>,
}

impl<T: Clone + Send + 'static> CompletionCell<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CellState {
                result: None,
                observers: VecDeque::new(),
                flushing: false,
            }),
        }
    }

    /// A cell that already holds `result`.
    pub fn completed(result: Result<T, ApiError>) -> Self {
        let cell = Self::new();
        cell.complete(result);
        cell
    }

    /// Store the final result and notify every queued observer in order.
    ///
    /// # Panics
    /// Panics if the cell was already completed: the producer broke its
    /// exactly-once contract.
    pub fn complete(&self, result: Result<T, ApiError>) {
        let mut state = self.state.lock();
        assert!(
            state.result.is_none(),
            "completion cell completed twice; the producer invoked its callback more than once"
        );
        state.result = Some(result.clone());
        state.flushing = true;
        // A panicking observer must not starve the rest of the queue or leave
        // the cell stuck in its flushing state; the first panic is re-raised
        // once every observer has run.
        let mut first_panic = None;
        while let Some(observer) = state.observers.pop_front() {
            let value = result.clone();
            let outcome = MutexGuard::unlocked(&mut state, move || {
                panic::catch_unwind(AssertUnwindSafe(move || observer(value)))
            });
            if let Err(payload) = outcome {
                first_panic.get_or_insert(payload);
            }
        }
        state.flushing = false;
        drop(state);
        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }
    }

    /// Attach an observer. Runs right away if the result is already known.
    pub fn observe(&self, observer: Observer<T>) {
        let mut state = self.state.lock();
        let ready = if state.flushing {
            None
        } else {
            state.result.clone()
        };
        match ready {
            Some(result) => {
                drop(state);
                observer(result);
            }
            None => state.observers.push_back(observer),
        }
    }

    /// The final result, if it has arrived.
    pub fn peek(&self) -> Option<Result<T, ApiError>> {
        self.state.lock().result.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().result.is_some()
    }
}

impl<T: Clone + Send + 'static> Default for CompletionCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for CompletionCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CompletionCell")
            .field("complete", &state.result.is_some())
            .field("observers", &state.observers.len())
            .finish()
    }
}

/// Forwards at most one cancel to a transport handle.
struct CancelForwarder {
    handle: Arc<dyn RequestHandle>,
    forwarded: AtomicBool,
}

impl CancelForwarder {
    fn new(handle: Arc<dyn RequestHandle>) -> Self {
        Self {
            handle,
            forwarded: AtomicBool::new(false),
        }
    }

    fn forward(&self) {
        if !self.forwarded.swap(true, Ordering::SeqCst) {
            tracing::debug!("forwarding cancellation to transport");
            self.handle.cancel();
        }
    }
}

/// A dispatched request whose result can be awaited any number of times.
pub struct AsyncRequest<T> {
    cell: Arc<CompletionCell<T>>,
    cancel: Arc<CancelForwarder>,
}

impl<T> Clone for AsyncRequest<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> AsyncRequest<T> {
    /// Dispatch `request` through `client`.
    pub fn send<C, Q>(client: &C, request: Q) -> Self
    where
        C: ApiClient + ?Sized,
        Q: ApiRequest<Response = T>,
    {
        let cell = Arc::new(CompletionCell::new());
        let sink = cell.clone();
        let handle = client.send(request, move |result| sink.complete(result));
        Self {
            cell,
            cancel: Arc::new(CancelForwarder::new(handle)),
        }
    }

    /// A request that was cancelled before it was ever dispatched.
    pub fn cancelled() -> Self {
        Self {
            cell: Arc::new(CompletionCell::completed(Err(ApiError::Cancelled))),
            cancel: Arc::new(CancelForwarder::new(Arc::new(FinishedHandle))),
        }
    }

    /// Ask the transport to abandon the request. Safe to call repeatedly.
    pub fn cancel(&self) {
        if !self.cell.is_complete() {
            self.cancel.forward();
        }
    }

    pub fn upload_progress(&self) -> Progress {
        self.cancel.handle.upload_progress()
    }

    pub fn download_progress(&self) -> Progress {
        self.cancel.handle.download_progress()
    }

    pub fn is_finished(&self) -> bool {
        self.cell.is_complete()
    }

    /// The final result, if it has arrived.
    pub fn result(&self) -> Option<Result<T, ApiError>> {
        self.cell.peek()
    }

    /// Callback form: `f` runs once with the final result.
    pub fn on_completion<F>(&self, f: F)
    where
        F: FnOnce(Result<T, ApiError>) + Send + 'static,
    {
        self.cell.observe(Box::new(f));
    }

    /// Await the final result.
    pub fn response(&self) -> ResponseFuture<T> {
        ResponseFuture::new(self.cell.clone(), self.cancel.clone(), None)
    }

    /// Await the final result, forwarding a cancel if `token` fires first.
    pub fn response_with_token(&self, token: &CancellationToken) -> ResponseFuture<T> {
        ResponseFuture::new(
            self.cell.clone(),
            self.cancel.clone(),
            Some(Box::pin(token.clone().cancelled_owned())),
        )
    }
}

impl<T> fmt::Debug for AsyncRequest<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncRequest").field("cell", &self.cell).finish()
    }
}

/// Future resolving to a request's final result.
///
/// Dropping it after it was polled but before it resolved forwards a cancel
/// to the transport.
#[must_use = "futures do nothing unless polled"]
pub struct ResponseFuture<T> {
    cell: Arc<CompletionCell<T>>,
    cancel: Arc<CancelForwarder>,
    sender: Option<oneshot::Sender<Result<T, ApiError>>>,
    receiver: oneshot::Receiver<Result<T, ApiError>>,
    token: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
    resolved: bool,
}

impl<T: Clone + Send + 'static> ResponseFuture<T> {
    fn new(
        cell: Arc<CompletionCell<T>>,
        cancel: Arc<CancelForwarder>,
        token: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
    ) -> Self {
        let (sender, receiver) = oneshot::channel();
        Self {
            cell,
            cancel,
            sender: Some(sender),
            receiver,
            token,
            resolved: false,
        }
    }
}

impl<T: Clone + Send + 'static> Future for ResponseFuture<T> {
    type Output = Result<T, ApiError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(sender) = this.sender.take() {
            this.cell.observe(Box::new(move |result| {
                let _ = sender.send(result);
            }));
        }
        if let Some(token) = this.token.as_mut() {
            if token.as_mut().poll(cx).is_ready() {
                this.token = None;
                this.cancel.forward();
            }
        }
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(result) => {
                this.resolved = true;
                Poll::Ready(result.unwrap_or(Err(ApiError::Cancelled)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for ResponseFuture<T> {
    fn drop(&mut self) {
        let awaited = self.sender.is_none();
        if awaited && !self.resolved && self.cell.state.lock().result.is_none() {
            self.cancel.forward();
        }
    }
}

/// Awaitable entry points for every `ApiClient`.
pub trait ApiClientExt: ApiClient {
    /// Dispatch `request` now and return a handle to its result.
    fn send_async<Q>(&self, request: Q) -> AsyncRequest<Q::Response>
    where
        Q: ApiRequest,
        Q::Response: Clone,
    {
        AsyncRequest::send(self, request)
    }

    /// Dispatch `request` now and await its decoded response.
    fn perform<Q>(&self, request: Q) -> ResponseFuture<Q::Response>
    where
        Q: ApiRequest,
        Q::Response: Clone,
    {
        self.send_async(request).response()
    }

    /// Like [`ApiClientExt::perform`], honouring `token`. A token that is
    /// already cancelled resolves with `ApiError::Cancelled` without sending
    /// anything.
    fn perform_with<Q>(&self, request: Q, token: &CancellationToken) -> ResponseFuture<Q::Response>
    where
        Q: ApiRequest,
        Q::Response: Clone,
    {
        if token.is_cancelled() {
            return AsyncRequest::cancelled().response();
        }
        self.send_async(request).response_with_token(token)
    }
}

impl<C: ApiClient> ApiClientExt for C {}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures::task::noop_waker_ref;
    use futures::FutureExt;
    use serde_json::{json, Value};

    use super::*;
    use crate::request::RequestSpec;

    type Pending = Box<dyn FnOnce(Result<Value, ApiError>) + Send>;

    #[derive(Default)]
    struct CountingHandle {
        cancels: AtomicUsize,
    }

    impl RequestHandle for CountingHandle {
        fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }

        fn download_progress(&self) -> Progress {
            Progress::new(1, Some(4))
        }
    }

    /// Client whose requests complete only when the test says so.
    #[derive(Default)]
    struct HandClient {
        pending: Mutex<VecDeque<Pending>>,
        handle: Arc<CountingHandle>,
    }

    impl HandClient {
        fn complete_next(&self, result: Result<Value, ApiError>) {
            let next = self.pending.lock().pop_front().expect("no pending request");
            next(result);
        }

        fn cancels(&self) -> usize {
            self.handle.cancels.load(Ordering::SeqCst)
        }
    }

    impl ApiClient for HandClient {
        fn send<Q, F>(&self, _request: Q, completion: F) -> Arc<dyn RequestHandle>
        where
            Q: ApiRequest,
            F: FnOnce(Result<Q::Response, ApiError>) + Send + 'static,
        {
            self.pending.lock().push_back(Box::new(move |result| {
                completion(result.and_then(|v| {
                    serde_json::from_value(v).map_err(|e| ApiError::Decoding(e.to_string()))
                }))
            }));
            self.handle.clone()
        }
    }

    fn user() -> RequestSpec<Value> {
        RequestSpec::get("/user")
    }

    fn poll_once<F: Future + Unpin>(future: &mut F) -> Poll<F::Output> {
        let mut cx = Context::from_waker(noop_waker_ref());
        future.poll_unpin(&mut cx)
    }

    #[test]
    fn observers_are_notified_once_in_registration_order() {
        let cell = CompletionCell::<u32>::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = log.clone();
            cell.observe(Box::new(move |r| log.lock().push((i, r.unwrap()))));
        }
        assert!(log.lock().is_empty());
        cell.complete(Ok(7));
        assert_eq!(*log.lock(), vec![(0, 7), (1, 7), (2, 7), (3, 7), (4, 7)]);
    }

    #[test]
    fn panicking_observer_does_not_starve_the_others() {
        let cell = Arc::new(CompletionCell::<u32>::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        cell.observe(Box::new(|_| panic!("observer failed")));
        let sink = log.clone();
        cell.observe(Box::new(move |r| sink.lock().push(("queued", r.unwrap()))));

        let completing = cell.clone();
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(move || completing.complete(Ok(3))));
        assert!(outcome.is_err());
        assert_eq!(*log.lock(), vec![("queued", 3)]);

        let sink = log.clone();
        cell.observe(Box::new(move |r| sink.lock().push(("late", r.unwrap()))));
        assert_eq!(*log.lock(), vec![("queued", 3), ("late", 3)]);
    }

    #[test]
    fn late_observer_runs_immediately() {
        let cell = CompletionCell::completed(Ok("done".to_string()));
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        cell.observe(Box::new(move |r| *sink.lock() = Some(r.unwrap())));
        assert_eq!(seen.lock().as_deref(), Some("done"));
    }

    #[test]
    fn observer_attached_during_flush_runs_last() {
        let cell = Arc::new(CompletionCell::<u32>::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let (inner_cell, inner_log) = (cell.clone(), log.clone());
        cell.observe(Box::new(move |_| {
            inner_log.lock().push("first");
            let late = inner_log.clone();
            inner_cell.observe(Box::new(move |_| late.lock().push("attached during flush")));
        }));
        let second = log.clone();
        cell.observe(Box::new(move |_| second.lock().push("second")));
        cell.complete(Ok(1));
        assert_eq!(*log.lock(), vec!["first", "second", "attached during flush"]);
    }

    #[test]
    #[should_panic(expected = "completed twice")]
    fn second_completion_panics() {
        let cell = CompletionCell::<u32>::new();
        cell.complete(Ok(1));
        cell.complete(Err(ApiError::Cancelled));
    }

    #[test]
    fn awaiting_twice_yields_the_same_value() {
        let client = HandClient::default();
        let request = client.send_async(user());
        let mut first = request.response();
        assert!(poll_once(&mut first).is_pending());

        client.complete_next(Ok(json!({"name": "YuAo"})));
        let Poll::Ready(Ok(a)) = poll_once(&mut first) else {
            panic!("first await did not resolve");
        };
        let b = request.response().now_or_never().unwrap().unwrap();
        assert_eq!(a, json!({"name": "YuAo"}));
        assert_eq!(a, b);
        assert!(request.is_finished());
        assert_eq!(client.cancels(), 0);
    }

    #[test]
    fn cancel_forwards_once_and_waits_for_the_transport() {
        let client = HandClient::default();
        let request = client.send_async(user());
        request.cancel();
        request.cancel();
        assert_eq!(client.cancels(), 1);
        assert!(request.result().is_none());

        client.complete_next(Err(ApiError::Cancelled));
        let err = request.response().now_or_never().unwrap().unwrap_err();
        assert!(err.is_cancelled());

        request.cancel();
        assert_eq!(client.cancels(), 1);
    }

    #[test]
    fn pre_cancelled_token_dispatches_nothing() {
        let client = HandClient::default();
        let token = CancellationToken::new();
        token.cancel();
        let result = client.perform_with(user(), &token).now_or_never().unwrap();
        assert!(result.unwrap_err().is_cancelled());
        assert!(client.pending.lock().is_empty());
        assert_eq!(client.cancels(), 0);
    }

    #[test]
    fn token_cancellation_is_forwarded_once() {
        let client = HandClient::default();
        let token = CancellationToken::new();
        let mut response = client.perform_with(user(), &token);
        assert!(poll_once(&mut response).is_pending());

        token.cancel();
        assert!(poll_once(&mut response).is_pending());
        assert!(poll_once(&mut response).is_pending());
        assert_eq!(client.cancels(), 1);

        client.complete_next(Err(ApiError::Cancelled));
        let Poll::Ready(result) = poll_once(&mut response) else {
            panic!("response did not resolve");
        };
        assert!(result.unwrap_err().is_cancelled());
    }

    #[test]
    fn dropping_an_awaited_response_cancels_the_request() {
        let client = HandClient::default();
        let request = client.send_async(user());

        drop(request.response());
        assert_eq!(client.cancels(), 0);

        let mut awaited = request.response();
        assert!(poll_once(&mut awaited).is_pending());
        drop(awaited);
        assert_eq!(client.cancels(), 1);

        client.complete_next(Err(ApiError::Cancelled));
        assert!(request.result().unwrap().unwrap_err().is_cancelled());
    }

    #[test]
    fn callback_form_and_progress() {
        let client = HandClient::default();
        let request = client.send_async(user());
        assert_eq!(request.download_progress().fraction(), Some(0.25));
        assert_eq!(request.upload_progress(), Progress::default());

        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        request.on_completion(move |r| *sink.lock() = Some(r.unwrap()));
        client.complete_next(Ok(json!(1)));
        assert_eq!(*seen.lock(), Some(json!(1)));
    }
}
