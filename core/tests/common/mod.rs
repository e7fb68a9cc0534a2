//! Scripted transport on virtual time, shared by the integration tests.
//!
//! Each `execute` pops the next scripted step, records when the request was
//! sent and answers after the step's latency on a `ManualScheduler`.
//! Cancelling an unanswered call answers it with `ApiError::Cancelled` on
//! the next scheduler tick.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_core::{
    ApiError, HttpMethod, HttpResponse, ManualScheduler, RequestDefaults, RequestHandle, ResolvedRequest, Scheduler,
    SimpleClient, Transport, TransportCompletion,
};
use parking_lot::Mutex;
use serde_json::Value;
use url::Url;

pub struct Step {
    pub latency: Duration,
    pub result: Result<HttpResponse, ApiError>,
}

/// `status` with `body` serialized as JSON, answered after `latency_ms`.
pub fn reply(latency_ms: u64, status: u16, body: Value) -> Step {
    Step {
        latency: Duration::from_millis(latency_ms),
        result: Ok(HttpResponse::new(status, body.to_string())),
    }
}

pub fn fail(latency_ms: u64, error: ApiError) -> Step {
    Step {
        latency: Duration::from_millis(latency_ms),
        result: Err(error),
    }
}

#[derive(Debug, Clone)]
pub struct Sent {
    pub at: Duration,
    pub request: ResolvedRequest,
}

pub struct ScriptedTransport {
    scheduler: Arc<ManualScheduler>,
    script: Mutex<VecDeque<Step>>,
    sent: Mutex<Vec<Sent>>,
    cancels: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    pub fn new(scheduler: Arc<ManualScheduler>, steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            scheduler,
            script: Mutex::new(steps.into_iter().collect()),
            sent: Mutex::new(Vec::new()),
            cancels: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn push(&self, step: Step) {
        self.script.lock().push_back(step);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    /// Virtual times at which requests were sent.
    pub fn sent_at(&self) -> Vec<Duration> {
        self.sent.lock().iter().map(|s| s.at).collect()
    }

    pub fn sent_paths(&self) -> Vec<String> {
        self.sent.lock().iter().map(|s| s.request.url.path().to_string()).collect()
    }

    /// Cancels forwarded to calls that had not been answered yet.
    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

impl Transport for ScriptedTransport {
    fn execute(&self, request: ResolvedRequest, completion: TransportCompletion) -> Arc<dyn RequestHandle> {
        self.sent.lock().push(Sent {
            at: self.scheduler.elapsed(),
            request,
        });
        let step = self.script.lock().pop_front().unwrap_or_else(|| Step {
            latency: Duration::ZERO,
            result: Err(ApiError::transport(std::io::Error::other("no scripted response"))),
        });
        let call = Arc::new(ScriptedCall {
            completion: Mutex::new(Some(completion)),
            scheduler: self.scheduler.clone(),
            cancels: self.cancels.clone(),
        });
        let answer = call.clone();
        self.scheduler
            .schedule(step.latency, Box::new(move || answer.answer(step.result)));
        call
    }
}

struct ScriptedCall {
    completion: Mutex<Option<TransportCompletion>>,
    scheduler: Arc<ManualScheduler>,
    cancels: Arc<AtomicUsize>,
}

impl ScriptedCall {
    fn answer(&self, result: Result<HttpResponse, ApiError>) {
        let completion = self.completion.lock().take();
        if let Some(completion) = completion {
            completion(result);
        }
    }
}

impl RequestHandle for ScriptedCall {
    fn cancel(&self) {
        let completion = self.completion.lock().take();
        if let Some(completion) = completion {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            self.scheduler
                .schedule(Duration::ZERO, Box::new(move || completion(Err(ApiError::Cancelled))));
        }
    }
}

pub fn defaults() -> RequestDefaults {
    RequestDefaults::new(Url::parse("https://api.example.com/v1/").unwrap(), HttpMethod::Get)
}

pub fn client(scheduler: &Arc<ManualScheduler>, steps: impl IntoIterator<Item = Step>) -> Arc<SimpleClient<ScriptedTransport>> {
    let transport = ScriptedTransport::new(scheduler.clone(), steps);
    Arc::new(SimpleClient::new(transport, defaults(), scheduler.clone() as Arc<dyn Scheduler>))
}
