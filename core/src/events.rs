//! Request lifecycle notifications.
//!
//! # Design
//! The client never owns its event handlers. `EventHandlers` keeps `Weak`
//! references, so a handler lives exactly as long as whoever registered it
//! keeps its `Arc`. Dead entries are pruned whenever the registry is read.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use url::Url;

use crate::error::ApiError;
use crate::http::{HttpMethod, Progress};
use crate::resolve::ResolvedRequest;

/// Timing and size figures for one completed request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskMetrics {
    pub url: Url,
    pub method: HttpMethod,
    pub status: Option<u16>,
    pub duration: Duration,
    pub response_body_bytes: usize,
    /// `None` when the transport completed before `execute` returned its
    /// handle, since there was no handle to read progress from.
    pub upload_progress: Option<Progress>,
    pub download_progress: Option<Progress>,
    pub error: Option<String>,
}

/// Details of a failed request.
#[derive(Debug, Clone)]
pub struct FailureEvent {
    pub url: Url,
    pub method: HttpMethod,
    pub status: Option<u16>,
    pub response_body: Option<Vec<u8>>,
    pub error: ApiError,
    pub metrics: Option<TaskMetrics>,
}

/// Observer of request lifecycle events. Every method defaults to a no-op.
pub trait EventHandler: Send + Sync {
    fn on_request_start(&self, _request: &ResolvedRequest) {}

    fn on_request_failure(&self, _event: &FailureEvent) {}

    fn on_metrics(&self, _metrics: &TaskMetrics) {}
}

/// Registry of non-owning handler references.
#[derive(Default)]
pub struct EventHandlers {
    handlers: Mutex<Vec<Weak<dyn EventHandler>>>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, handler: &Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.lock();
        if !handlers.iter().any(|h| same_handler(h, handler)) {
            handlers.push(Arc::downgrade(handler));
        }
    }

    pub fn remove(&self, handler: &Arc<dyn EventHandler>) {
        self.handlers.lock().retain(|h| !same_handler(h, handler));
    }

    /// Live handlers, in registration order.
    pub fn snapshot(&self) -> Vec<Arc<dyn EventHandler>> {
        let mut handlers = self.handlers.lock();
        handlers.retain(|h| h.strong_count() > 0);
        handlers.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn request_started(&self, request: &ResolvedRequest) {
        for handler in self.snapshot() {
            handler.on_request_start(request);
        }
    }

    pub fn request_failed(&self, event: &FailureEvent) {
        for handler in self.snapshot() {
            handler.on_request_failure(event);
        }
    }

    pub fn metrics_collected(&self, metrics: &TaskMetrics) {
        for handler in self.snapshot() {
            handler.on_metrics(metrics);
        }
    }
}

fn same_handler(weak: &Weak<dyn EventHandler>, handler: &Arc<dyn EventHandler>) -> bool {
    std::ptr::addr_eq(weak.as_ptr(), Arc::as_ptr(handler))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::defaults::RequestDefaults;
    use crate::request::RequestSpec;
    use crate::resolve::resolve;

    #[derive(Default)]
    struct Counter {
        starts: AtomicUsize,
    }

    impl EventHandler for Counter {
        fn on_request_start(&self, _request: &ResolvedRequest) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn request() -> ResolvedRequest {
        let defaults = RequestDefaults::new(Url::parse("https://example.com").unwrap(), HttpMethod::Get);
        resolve(&RequestSpec::<()>::new("/"), &defaults)
    }

    #[test]
    fn registry_does_not_keep_handlers_alive() {
        let registry = EventHandlers::new();
        let counter = Arc::new(Counter::default());
        let handler: Arc<dyn EventHandler> = counter.clone();
        registry.add(&handler);
        registry.request_started(&request());
        assert_eq!(counter.starts.load(Ordering::SeqCst), 1);

        drop(handler);
        drop(counter);
        assert!(registry.is_empty());
    }

    #[test]
    fn add_is_idempotent_and_remove_detaches() {
        let registry = EventHandlers::new();
        let counter = Arc::new(Counter::default());
        let handler: Arc<dyn EventHandler> = counter.clone();
        registry.add(&handler);
        registry.add(&handler);
        assert_eq!(registry.len(), 1);

        registry.request_started(&request());
        registry.remove(&handler);
        registry.request_started(&request());
        assert_eq!(counter.starts.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn metrics_serialize_to_json() {
        let metrics = TaskMetrics {
            url: Url::parse("https://example.com/a").unwrap(),
            method: HttpMethod::Get,
            status: Some(200),
            duration: Duration::from_millis(12),
            response_body_bytes: 3,
            upload_progress: None,
            download_progress: Some(Progress::new(3, Some(3))),
            error: None,
        };
        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["url"], "https://example.com/a");
        assert_eq!(json["method"], "GET");
        assert_eq!(json["download_progress"]["total"], 3);
    }
}
