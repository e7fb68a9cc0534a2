//! Typed request pipeline for HTTP APIs.
//!
//! # Overview
//! Callers describe a request declaratively with [`ApiRequest`] (or the
//! ready-made [`RequestSpec`]), the client merges it with shared
//! [`RequestDefaults`] and hands the [`ResolvedRequest`] to a [`Transport`].
//! Results come back through a callback ([`ApiClient::send`]), an awaitable
//! handle ([`ApiClientExt`]) or a long-running [`PollingTask`].
//!
//! # Design
//! - The core performs no I/O itself. A `Transport` executes requests and
//!   calls back exactly once per request; time comes from a [`Scheduler`],
//!   which makes every state machine here deterministic under
//!   [`ManualScheduler`].
//! - Resolution is a pure function. Defaults are passed explicitly through
//!   a [`DefaultsProvider`], never read from global state.
//! - Cancellation is cooperative: cancelling asks the transport to stop,
//!   and the final outcome still arrives through its callback.

pub mod bridge;
pub mod client;
pub mod defaults;
pub mod encoding;
pub mod error;
pub mod events;
pub mod http;
pub mod params;
pub mod polling;
pub mod request;
pub mod resolve;
pub mod scheduler;
pub mod transport;

pub use bridge::{ApiClientExt, AsyncRequest, CompletionCell, ResponseFuture};
pub use client::{ApiClient, ClientConfig, JsonDecoder, ResponseDecoder, SimpleClient};
pub use defaults::{DefaultsProvider, RequestDefaults};
pub use error::ApiError;
pub use events::{EventHandler, EventHandlers, FailureEvent, TaskMetrics};
pub use http::{Headers, HttpMethod, HttpRequest, HttpResponse, Progress, QueryItem};
pub use params::{MultipartItem, Parameters};
pub use polling::{
    FnCoordinator, PollState, Poller, PollingConfig, PollingCoordinator, PollingFuture, PollingTask, TaskPhase,
};
pub use request::{ApiRequest, RequestSpec};
pub use resolve::{resolve, ResolvedRequest};
pub use scheduler::{ManualScheduler, Scheduler, TimerHandle, TokioScheduler};
pub use transport::{FinishedHandle, RequestHandle, Transport, TransportCompletion};

pub use tokio_util::sync::CancellationToken;
