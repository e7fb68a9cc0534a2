//! Typed request dispatch.
//!
//! # Design
//! `ApiClient` is the callback-based primitive everything else builds on:
//! send a typed request, get a cancellable handle back immediately, and have
//! the completion invoked exactly once with the decoded result.
//!
//! `SimpleClient` implements it on top of a raw `Transport`: it resolves the
//! request against the current defaults, short-circuits mocked requests,
//! maps non-success statuses to errors, decodes the body and reports
//! lifecycle events to registered handlers. Every request it sends stays in
//! a live set until its completion runs, so `cancel_all_requests` can reach
//! handles the caller already dropped.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::defaults::DefaultsProvider;
use crate::error::ApiError;
use crate::events::{EventHandler, EventHandlers, FailureEvent, TaskMetrics};
use crate::http::{HttpMethod, HttpResponse};
use crate::request::ApiRequest;
use crate::scheduler::Scheduler;
use crate::transport::{RequestHandle, Transport};

/// Sends typed requests and reports decoded results through a callback.
///
/// Implementations must invoke `completion` exactly once per call, even
/// after the returned handle was cancelled (with `ApiError::Cancelled`).
pub trait ApiClient: Send + Sync + 'static {
    fn send<Q, F>(&self, request: Q, completion: F) -> Arc<dyn RequestHandle>
    where
        Q: ApiRequest,
        F: FnOnce(Result<Q::Response, ApiError>) + Send + 'static;
}

impl<C: ApiClient> ApiClient for Arc<C> {
    fn send<Q, F>(&self, request: Q, completion: F) -> Arc<dyn RequestHandle>
    where
        Q: ApiRequest,
        F: FnOnce(Result<Q::Response, ApiError>) + Send + 'static,
    {
        (**self).send(request, completion)
    }
}

/// Turns response bytes into typed values.
pub trait ResponseDecoder: Send + Sync + 'static {
    fn decode<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, ApiError>;
}

/// Decodes JSON bodies with `serde_json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDecoder;

impl ResponseDecoder for JsonDecoder {
    fn decode<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, ApiError> {
        serde_json::from_slice(body).map_err(|e| ApiError::Decoding(e.to_string()))
    }
}

/// Tunables for `SimpleClient`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Delay before a mocked request delivers its canned result.
    pub mock_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            mock_delay: Duration::from_millis(100),
        }
    }
}

/// `ApiClient` over a raw `Transport`.
pub struct SimpleClient<T, D = JsonDecoder> {
    transport: T,
    defaults: DefaultsProvider,
    decoder: Arc<D>,
    scheduler: Arc<dyn Scheduler>,
    events: Arc<EventHandlers>,
    live: Arc<LiveRequests>,
    config: ClientConfig,
}

impl<T: Transport> SimpleClient<T, JsonDecoder> {
    pub fn new(
        transport: T,
        defaults: impl Into<DefaultsProvider>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self::with_decoder(transport, defaults, scheduler, JsonDecoder)
    }
}

impl<T: Transport, D: ResponseDecoder> SimpleClient<T, D> {
    pub fn with_decoder(
        transport: T,
        defaults: impl Into<DefaultsProvider>,
        scheduler: Arc<dyn Scheduler>,
        decoder: D,
    ) -> Self {
        Self {
            transport,
            defaults: defaults.into(),
            decoder: Arc::new(decoder),
            scheduler,
            events: Arc::new(EventHandlers::new()),
            live: Arc::new(LiveRequests::default()),
            config: ClientConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn add_event_handler(&self, handler: &Arc<dyn EventHandler>) {
        self.events.add(handler);
    }

    pub fn remove_event_handler(&self, handler: &Arc<dyn EventHandler>) {
        self.events.remove(handler);
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Cancel every request this client has sent that has not completed,
    /// mocked ones included. Each completion still runs once, with
    /// `ApiError::Cancelled` unless its result was already on the way.
    pub fn cancel_all_requests(&self) {
        let handles = self.live.snapshot();
        tracing::debug!(count = handles.len(), "cancelling all requests");
        for handle in handles {
            handle.cancel();
        }
    }

    /// Number of sent requests whose completion has not run yet.
    pub fn outstanding_requests(&self) -> usize {
        self.live.len()
    }
}

impl<T: Transport, D: ResponseDecoder> ApiClient for SimpleClient<T, D> {
    fn send<Q, F>(&self, request: Q, completion: F) -> Arc<dyn RequestHandle>
    where
        Q: ApiRequest,
        F: FnOnce(Result<Q::Response, ApiError>) + Send + 'static,
    {
        let resolved = request.resolve(&self.defaults.current());
        self.events.request_started(&resolved);

        let entry = self.live.register();

        if let Some(mock) = request.mock() {
            tracing::debug!(url = %resolved.url, "delivering mocked response");
            let finished = entry.clone();
            let handle = MockedRequest::start(self.scheduler.clone(), self.config.mock_delay, mock, move |result| {
                finished.detach();
                completion(result)
            });
            entry.attach(&handle);
            return handle;
        }

        tracing::debug!(method = %resolved.method, url = %resolved.url, "sending request");
        let url = resolved.url.clone();
        let method = resolved.method;
        let started = self.scheduler.now();
        let scheduler = self.scheduler.clone();
        let decoder = self.decoder.clone();
        let events = self.events.clone();
        let finished = entry.clone();

        let handle = self.transport.execute(
            resolved,
            Box::new(move |result| {
                let report = Report {
                    url,
                    method,
                    duration: scheduler.now().saturating_duration_since(started),
                    handle: finished.detach(),
                };
                let outcome = match result {
                    Ok(response) => {
                        let decoded = decode_response::<Q::Response, D>(&decoder, method, &response);
                        report.finish(&events, Some(&response), decoded.as_ref().err());
                        decoded
                    }
                    Err(error) => {
                        report.finish(&events, None, Some(&error));
                        Err(error)
                    }
                };
                if let Err(error) = &outcome {
                    tracing::debug!(error = %error, "request failed");
                }
                completion(outcome);
            }),
        );
        entry.attach(&handle);
        handle
    }
}

/// Requests sent through a client whose completion has not run yet.
#[derive(Default)]
struct LiveRequests {
    next_id: AtomicU64,
    handles: Mutex<BTreeMap<u64, Arc<dyn RequestHandle>>>,
}

impl LiveRequests {
    fn register(self: &Arc<Self>) -> Arc<LiveEntry> {
        Arc::new(LiveEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            live: self.clone(),
            state: Mutex::new(EntryState::default()),
        })
    }

    fn snapshot(&self) -> Vec<Arc<dyn RequestHandle>> {
        self.handles.lock().values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.handles.lock().len()
    }
}

#[derive(Default)]
struct EntryState {
    handle: Option<Arc<dyn RequestHandle>>,
    done: bool,
}

/// One request's membership in `LiveRequests`. The completion may run before
/// `execute` returns, so whichever of `attach` and `detach` comes second
/// decides whether the handle is listed.
struct LiveEntry {
    id: u64,
    live: Arc<LiveRequests>,
    state: Mutex<EntryState>,
}

impl LiveEntry {
    fn attach(&self, handle: &Arc<dyn RequestHandle>) {
        let mut state = self.state.lock();
        if state.done {
            return;
        }
        state.handle = Some(handle.clone());
        self.live.handles.lock().insert(self.id, handle.clone());
    }

    /// Leave the live set. Returns the handle if `attach` ran first.
    fn detach(&self) -> Option<Arc<dyn RequestHandle>> {
        let handle = {
            let mut state = self.state.lock();
            state.done = true;
            state.handle.take()
        };
        self.live.handles.lock().remove(&self.id);
        handle
    }
}

struct Report {
    url: url::Url,
    method: HttpMethod,
    duration: Duration,
    handle: Option<Arc<dyn RequestHandle>>,
}

impl Report {
    fn finish(self, events: &EventHandlers, response: Option<&HttpResponse>, error: Option<&ApiError>) {
        let metrics = TaskMetrics {
            url: self.url.clone(),
            method: self.method,
            status: response.map(|r| r.status),
            duration: self.duration,
            response_body_bytes: response.map_or(0, |r| r.body.len()),
            upload_progress: self.handle.as_ref().map(|h| h.upload_progress()),
            download_progress: self.handle.as_ref().map(|h| h.download_progress()),
            error: error.map(ToString::to_string),
        };
        if let Some(error) = error {
            events.request_failed(&FailureEvent {
                url: self.url,
                method: self.method,
                status: response.map(|r| r.status),
                response_body: response.map(|r| r.body.clone()),
                error: error.clone(),
                metrics: Some(metrics.clone()),
            });
        }
        events.metrics_collected(&metrics);
    }
}

/// Map non-success status codes to the appropriate `ApiError` variant.
fn check_status(response: &HttpResponse) -> Result<(), ApiError> {
    if response.is_success() {
        return Ok(());
    }
    if response.status == 404 {
        return Err(ApiError::NotFound);
    }
    Err(ApiError::HttpStatus {
        status: response.status,
        body: String::from_utf8_lossy(&response.body).into_owned(),
    })
}

fn decode_response<R, D>(decoder: &D, method: HttpMethod, response: &HttpResponse) -> Result<R, ApiError>
where
    R: DeserializeOwned,
    D: ResponseDecoder,
{
    check_status(response)?;
    if response.body.is_empty() {
        if matches!(response.status, 204 | 205) || method == HttpMethod::Head {
            return serde_json::from_slice(b"null").map_err(|e| ApiError::Decoding(e.to_string()));
        }
        return Err(ApiError::Decoding("response body is empty".to_string()));
    }
    decoder.decode(&response.body)
}

type MockCompletion<R> = Box<dyn FnOnce(Result<R, ApiError>) + Send>;

/// Handle for a request answered from its mock. Whichever of delivery or
/// cancellation happens first wins; the other becomes a no-op.
struct MockedRequest<R> {
    completion: Mutex<Option<(Result<R, ApiError>, MockCompletion<R>)>>,
    scheduler: Arc<dyn Scheduler>,
}

impl<R: Send + 'static> MockedRequest<R> {
    fn start<F>(
        scheduler: Arc<dyn Scheduler>,
        delay: Duration,
        result: Result<R, ApiError>,
        completion: F,
    ) -> Arc<dyn RequestHandle>
    where
        F: FnOnce(Result<R, ApiError>) + Send + 'static,
    {
        let mocked = Arc::new(Self {
            completion: Mutex::new(Some((result, Box::new(completion)))),
            scheduler: scheduler.clone(),
        });
        let deliver = mocked.clone();
        scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some((result, completion)) = deliver.take() {
                    completion(result);
                }
            }),
        );
        mocked
    }

    fn take(&self) -> Option<(Result<R, ApiError>, MockCompletion<R>)> {
        self.completion.lock().take()
    }
}

impl<R: Send + 'static> RequestHandle for MockedRequest<R> {
    fn cancel(&self) {
        if let Some((_, completion)) = self.take() {
            self.scheduler
                .schedule(Duration::ZERO, Box::new(move || completion(Err(ApiError::Cancelled))));
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Item {
        title: String,
    }

    fn response(status: u16, body: &str) -> HttpResponse {
        HttpResponse::new(status, body.as_bytes().to_vec())
    }

    #[test]
    fn decode_success() {
        let item: Item = decode_response(&JsonDecoder, HttpMethod::Get, &response(200, r#"{"title":"Test"}"#)).unwrap();
        assert_eq!(item.title, "Test");
    }

    #[test]
    fn decode_not_found() {
        let err = decode_response::<Item, _>(&JsonDecoder, HttpMethod::Get, &response(404, "")).unwrap_err();
        assert!(matches!(err, ApiError::NotFound));
    }

    #[test]
    fn decode_wrong_status() {
        let err = decode_response::<Item, _>(&JsonDecoder, HttpMethod::Post, &response(500, "internal error"))
            .unwrap_err();
        assert!(matches!(err, ApiError::HttpStatus { status: 500, ref body } if body == "internal error"));
    }

    #[test]
    fn decode_bad_json() {
        let err = decode_response::<Item, _>(&JsonDecoder, HttpMethod::Get, &response(200, "not json")).unwrap_err();
        assert!(matches!(err, ApiError::Decoding(_)));
    }

    #[test]
    fn empty_body_allowed_for_no_content() {
        decode_response::<(), _>(&JsonDecoder, HttpMethod::Delete, &response(204, "")).unwrap();
        let head: Option<Item> = decode_response(&JsonDecoder, HttpMethod::Head, &response(200, "")).unwrap();
        assert_eq!(head, None);
    }

    #[test]
    fn empty_body_rejected_when_content_expected() {
        let err = decode_response::<Item, _>(&JsonDecoder, HttpMethod::Get, &response(200, "")).unwrap_err();
        assert!(matches!(err, ApiError::Decoding(ref msg) if msg.contains("empty")));
    }

    #[test]
    fn client_config_defaults() {
        let config: ClientConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.mock_delay, Duration::from_millis(100));
    }
}
