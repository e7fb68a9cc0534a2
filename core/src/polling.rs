//! Long-running jobs: one initial request, then a check request re-issued
//! on a timer until a coordinator says the job is done.
//!
//! # Design
//! ```text
//! starting ──▶ checking ──▶ waiting ──▶ checking ──▶ … ──▶ finished
//!    │            │  ▲ (check slower than interval) │
//!    │            └──┘                              │
//!    └──────────────┴──────── cancel ───────────────┴──▶ cancelled
//! ```
//! A `PollingCoordinator` supplies the policy: how to build a check request
//! from the initial response, and how to read each check response. Any error
//! is terminal; only `PollState::Progressing` loops.
//!
//! The state lives behind one mutex that is never held while calling into
//! the client, the coordinator or the completion. Every dispatched request
//! and every armed timer carries a sequence number, so callbacks that arrive
//! after the task moved on (or ended) are recognised as stale and ignored.
//! At most one check timer is live; arming a new one cancels the previous.
//!
//! A separate deadline timer enforces `PollingConfig::task_timeout`. When it
//! fires first, the task cancels whatever is in flight, notifies the
//! coordinator and fails with `ApiError::TimedOut`.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use uuid::Uuid;

use crate::client::ApiClient;
use crate::error::ApiError;
use crate::request::ApiRequest;
use crate::scheduler::{Scheduler, TimerHandle};
use crate::transport::RequestHandle;

/// A coordinator's reading of one check response.
#[derive(Debug)]
pub enum PollState<T> {
    /// Not done yet; check again.
    Progressing,
    /// Done, successfully or not.
    Finished(Result<T, ApiError>),
}

/// Policy object driving a polling task.
pub trait PollingCoordinator: Send + Sync + 'static {
    type InitialRequest: ApiRequest;
    type CheckRequest: ApiRequest + Clone;
    type Output: Send + 'static;

    /// Build the check request from the initial response. An error ends the
    /// task before any check is sent.
    fn make_check_request(
        &self,
        initial: <Self::InitialRequest as ApiRequest>::Response,
    ) -> Result<Self::CheckRequest, ApiError>;

    fn handle_check_result(
        &self,
        response: <Self::CheckRequest as ApiRequest>::Response,
    ) -> PollState<Self::Output>;

    /// Called once when the task is cancelled or times out, e.g. to tell the
    /// server to abandon the job.
    fn handle_cancelled(&self) {}
}

type MakeCheck<I, C> = Box<dyn Fn(<I as ApiRequest>::Response) -> Result<C, ApiError> + Send + Sync>;
type HandleResult<C, O> = Box<dyn Fn(<C as ApiRequest>::Response) -> PollState<O> + Send + Sync>;

/// Coordinator assembled from closures.
pub struct FnCoordinator<I: ApiRequest, C: ApiRequest, O> {
    make_check: MakeCheck<I, C>,
    handle_result: HandleResult<C, O>,
    on_cancel: Option<Box<dyn Fn() + Send + Sync>>,
    _marker: PhantomData<fn() -> (I, O)>,
}

impl<I, C, O> FnCoordinator<I, C, O>
where
    I: ApiRequest,
    C: ApiRequest + Clone,
    O: Send + 'static,
{
    pub fn new(
        make_check: impl Fn(I::Response) -> Result<C, ApiError> + Send + Sync + 'static,
        handle_result: impl Fn(C::Response) -> PollState<O> + Send + Sync + 'static,
    ) -> Self {
        Self {
            make_check: Box::new(make_check),
            handle_result: Box::new(handle_result),
            on_cancel: None,
            _marker: PhantomData,
        }
    }

    /// Hook run when the task is cancelled or times out.
    pub fn on_cancel(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_cancel = Some(Box::new(f));
        self
    }
}

impl<I, C, O> PollingCoordinator for FnCoordinator<I, C, O>
where
    I: ApiRequest,
    C: ApiRequest + Clone,
    O: Send + 'static,
{
    type InitialRequest = I;
    type CheckRequest = C;
    type Output = O;

    fn make_check_request(&self, initial: I::Response) -> Result<C, ApiError> {
        (self.make_check)(initial)
    }

    fn handle_check_result(&self, response: C::Response) -> PollState<O> {
        (self.handle_result)(response)
    }

    fn handle_cancelled(&self) {
        if let Some(f) = &self.on_cancel {
            f();
        }
    }
}

/// Timing knobs for polling tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Wall-clock budget for the whole task, initial request included.
    pub task_timeout: Duration,
    /// Minimum spacing between the starts of consecutive check requests.
    pub check_interval: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(600),
            check_interval: Duration::from_secs(1),
        }
    }
}

impl PollingConfig {
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }
}

/// Where a polling task currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskPhase {
    Starting,
    Checking,
    Waiting,
    Finished,
    Cancelled,
}

impl TaskPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskPhase::Finished | TaskPhase::Cancelled)
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskPhase::Starting => "starting",
            TaskPhase::Checking => "checking",
            TaskPhase::Waiting => "waiting",
            TaskPhase::Finished => "finished",
            TaskPhase::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Starts polling tasks against one client.
pub struct Poller<C> {
    client: Arc<C>,
    scheduler: Arc<dyn Scheduler>,
    config: PollingConfig,
}

impl<C> Clone for Poller<C> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            scheduler: self.scheduler.clone(),
            config: self.config,
        }
    }
}

impl<C: ApiClient> Poller<C> {
    pub fn new(client: Arc<C>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            client,
            scheduler,
            config: PollingConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PollingConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &PollingConfig {
        &self.config
    }

    /// Send `initial` and poll until `coordinator` reports a result, which is
    /// handed to `completion` exactly once.
    pub fn start<P, F>(&self, initial: P::InitialRequest, coordinator: P, completion: F) -> PollingTask
    where
        P: PollingCoordinator,
        F: FnOnce(Result<P::Output, ApiError>) + Send + 'static,
    {
        let inner = Arc::new(TaskInner {
            id: Uuid::new_v4(),
            client: self.client.clone(),
            scheduler: self.scheduler.clone(),
            coordinator,
            config: self.config,
            state: Mutex::new(TaskState {
                phase: TaskPhase::Starting,
                check_request: None,
                in_flight: None,
                request_seq: 0,
                answered_seq: 0,
                check_timer: None,
                timer_seq: 0,
                deadline: None,
                checks: 0,
                completion: Some(Box::new(completion)),
            }),
        });
        tracing::info!(
            task_id = %inner.id,
            interval_ms = self.config.check_interval.as_millis() as u64,
            timeout_ms = self.config.task_timeout.as_millis() as u64,
            "polling task started"
        );
        inner.arm_deadline();
        inner.send_initial(initial);
        PollingTask { inner }
    }

    /// Awaitable form of [`Poller::start`]. Dropping the future before it
    /// resolves cancels the task.
    pub fn perform<P>(&self, initial: P::InitialRequest, coordinator: P) -> PollingFuture<P::Output>
    where
        P: PollingCoordinator,
    {
        let (sender, receiver) = oneshot::channel();
        let task = self.start(initial, coordinator, move |result| {
            let _ = sender.send(result);
        });
        PollingFuture::new(task, receiver, None)
    }

    /// Like [`Poller::perform`], cancelling the task when `token` fires. A
    /// token that is already cancelled resolves with `ApiError::Cancelled`
    /// without sending anything.
    pub fn perform_with<P>(
        &self,
        initial: P::InitialRequest,
        coordinator: P,
        token: &CancellationToken,
    ) -> PollingFuture<P::Output>
    where
        P: PollingCoordinator,
    {
        if token.is_cancelled() {
            let (sender, receiver) = oneshot::channel();
            let _ = sender.send(Err(ApiError::Cancelled));
            let task = PollingTask {
                inner: Arc::new(NeverStarted { id: Uuid::new_v4() }),
            };
            return PollingFuture::new(task, receiver, None);
        }
        let (sender, receiver) = oneshot::channel();
        let task = self.start(initial, coordinator, move |result| {
            let _ = sender.send(result);
        });
        PollingFuture::new(task, receiver, Some(Box::pin(token.clone().cancelled_owned())))
    }
}

trait TaskControl: Send + Sync {
    fn id(&self) -> Uuid;
    fn phase(&self) -> TaskPhase;
    fn checks(&self) -> u32;
    fn cancel(&self);
}

/// Handle to a running polling task. Clones refer to the same task.
#[derive(Clone)]
pub struct PollingTask {
    inner: Arc<dyn TaskControl>,
}

impl PollingTask {
    pub fn id(&self) -> Uuid {
        self.inner.id()
    }

    pub fn phase(&self) -> TaskPhase {
        self.inner.phase()
    }

    pub fn is_finished(&self) -> bool {
        self.phase().is_terminal()
    }

    /// Number of check requests sent so far.
    pub fn checks(&self) -> u32 {
        self.inner.checks()
    }

    /// Abandon the task. The completion receives `ApiError::Cancelled`
    /// unless it already has a result; later calls do nothing.
    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

impl fmt::Debug for PollingTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingTask")
            .field("id", &self.id())
            .field("phase", &self.phase())
            .finish()
    }
}

type Completion<T> = Box<dyn FnOnce(Result<T, ApiError>) + Send>;

struct TaskState<P: PollingCoordinator> {
    phase: TaskPhase,
    check_request: Option<P::CheckRequest>,
    in_flight: Option<(u64, Arc<dyn RequestHandle>)>,
    request_seq: u64,
    answered_seq: u64,
    check_timer: Option<TimerHandle>,
    timer_seq: u64,
    deadline: Option<TimerHandle>,
    checks: u32,
    completion: Option<Completion<P::Output>>,
}

/// Everything a terminated task still has to release or notify.
struct Teardown<T> {
    completion: Option<Completion<T>>,
    timers: Vec<TimerHandle>,
    in_flight: Option<Arc<dyn RequestHandle>>,
}

struct TaskInner<C, P: PollingCoordinator> {
    id: Uuid,
    client: Arc<C>,
    scheduler: Arc<dyn Scheduler>,
    coordinator: P,
    config: PollingConfig,
    state: Mutex<TaskState<P>>,
}

impl<C: ApiClient, P: PollingCoordinator> TaskInner<C, P> {
    fn arm_deadline(self: &Arc<Self>) {
        let task = self.clone();
        let timer = self
            .scheduler
            .schedule(self.config.task_timeout, Box::new(move || task.time_out()));
        let mut state = self.state.lock();
        if state.phase.is_terminal() {
            drop(state);
            timer.cancel();
        } else {
            state.deadline = Some(timer);
        }
    }

    fn send_initial(self: &Arc<Self>, request: P::InitialRequest) {
        self.dispatch(TaskPhase::Starting, request, |task, result| task.on_initial(result));
    }

    fn on_initial(self: &Arc<Self>, result: Result<<P::InitialRequest as ApiRequest>::Response, ApiError>) {
        let check = match result.and_then(|response| self.coordinator.make_check_request(response)) {
            Ok(check) => check,
            Err(error) => return self.finish(Err(error)),
        };
        {
            let mut state = self.state.lock();
            if state.phase.is_terminal() {
                return;
            }
            state.check_request = Some(check.clone());
        }
        self.send_check(check);
    }

    fn send_check(self: &Arc<Self>, request: P::CheckRequest) {
        let started = self.scheduler.now();
        self.dispatch(TaskPhase::Checking, request, move |task, result| {
            task.on_check_result(started, result)
        });
    }

    fn on_check_result(
        self: &Arc<Self>,
        started: Instant,
        result: Result<<P::CheckRequest as ApiRequest>::Response, ApiError>,
    ) {
        let response = match result {
            Ok(response) => response,
            Err(error) => return self.finish(Err(error)),
        };
        match self.coordinator.handle_check_result(response) {
            PollState::Finished(result) => self.finish(result),
            PollState::Progressing => {
                let elapsed = self.scheduler.now().saturating_duration_since(started);
                let interval = self.config.check_interval;
                if elapsed >= interval {
                    tracing::debug!(
                        task_id = %self.id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "check outlasted the interval, re-checking now"
                    );
                }
                // A zero-delay timer still goes through the scheduler, so a
                // client that answers inline cannot grow the stack per check.
                self.arm_check_timer(interval.saturating_sub(elapsed));
            }
        }
    }

    fn arm_check_timer(self: &Arc<Self>, delay: Duration) {
        let previous = {
            let mut state = self.state.lock();
            if state.phase.is_terminal() {
                return;
            }
            state.timer_seq += 1;
            let seq = state.timer_seq;
            let task = self.clone();
            let timer = self
                .scheduler
                .schedule(delay, Box::new(move || task.on_timer(seq)));
            if !delay.is_zero() {
                state.phase = TaskPhase::Waiting;
            }
            state.check_timer.replace(timer)
        };
        if let Some(previous) = previous {
            previous.cancel();
        }
        if !delay.is_zero() {
            tracing::debug!(task_id = %self.id, delay_ms = delay.as_millis() as u64, "waiting before next check");
        }
    }

    fn on_timer(self: &Arc<Self>, seq: u64) {
        let request = {
            let mut state = self.state.lock();
            if state.phase.is_terminal() || state.timer_seq != seq {
                return;
            }
            state.check_timer = None;
            state.check_request.clone()
        };
        if let Some(request) = request {
            self.send_check(request);
        }
    }

    /// Send `request` through the client, routing its result to `on_result`
    /// unless the task has moved on by the time it arrives.
    fn dispatch<Q, F>(self: &Arc<Self>, phase: TaskPhase, request: Q, on_result: F)
    where
        Q: ApiRequest,
        F: FnOnce(&Arc<Self>, Result<Q::Response, ApiError>) + Send + 'static,
    {
        let seq = {
            let mut state = self.state.lock();
            if state.phase.is_terminal() {
                return;
            }
            state.phase = phase;
            state.request_seq += 1;
            if phase == TaskPhase::Checking {
                state.checks += 1;
            }
            state.request_seq
        };
        tracing::debug!(task_id = %self.id, phase = %phase, seq, "dispatching request");

        let task = self.clone();
        let handle = self.client.send(request, move |result| {
            {
                let mut state = task.state.lock();
                state.answered_seq = state.answered_seq.max(seq);
                if matches!(state.in_flight, Some((s, _)) if s == seq) {
                    state.in_flight = None;
                }
                if state.phase.is_terminal() || state.request_seq != seq {
                    tracing::trace!(task_id = %task.id, seq, "ignoring stale response");
                    return;
                }
            }
            on_result(&task, result);
        });

        let mut state = self.state.lock();
        if state.answered_seq >= seq {
            return;
        }
        if state.phase.is_terminal() {
            drop(state);
            handle.cancel();
        } else {
            state.in_flight = Some((seq, handle));
        }
    }

    fn finish(&self, result: Result<P::Output, ApiError>) {
        let Some(teardown) = self.terminate(TaskPhase::Finished) else {
            return;
        };
        match &result {
            Ok(_) => tracing::info!(task_id = %self.id, "polling task finished"),
            Err(error) => tracing::info!(task_id = %self.id, error = %error, "polling task failed"),
        }
        Self::release(teardown, result);
    }

    fn time_out(&self) {
        let Some(teardown) = self.terminate(TaskPhase::Finished) else {
            return;
        };
        tracing::warn!(
            task_id = %self.id,
            timeout_ms = self.config.task_timeout.as_millis() as u64,
            "polling task timed out"
        );
        self.coordinator.handle_cancelled();
        Self::release(teardown, Err(ApiError::TimedOut(self.config.task_timeout)));
    }

    /// Move to `phase` and detach everything still attached to the task.
    /// Returns `None` when the task had already ended.
    fn terminate(&self, phase: TaskPhase) -> Option<Teardown<P::Output>> {
        let mut state = self.state.lock();
        if state.phase.is_terminal() {
            return None;
        }
        state.phase = phase;
        state.check_request = None;
        let timers = state.check_timer.take().into_iter().chain(state.deadline.take()).collect();
        Some(Teardown {
            completion: state.completion.take(),
            timers,
            in_flight: state.in_flight.take().map(|(_, handle)| handle),
        })
    }

    fn release(teardown: Teardown<P::Output>, result: Result<P::Output, ApiError>) {
        for timer in teardown.timers {
            timer.cancel();
        }
        if let Some(handle) = teardown.in_flight {
            handle.cancel();
        }
        if let Some(completion) = teardown.completion {
            completion(result);
        }
    }
}

impl<C: ApiClient, P: PollingCoordinator> TaskControl for TaskInner<C, P> {
    fn id(&self) -> Uuid {
        self.id
    }

    fn phase(&self) -> TaskPhase {
        self.state.lock().phase
    }

    fn checks(&self) -> u32 {
        self.state.lock().checks
    }

    fn cancel(&self) {
        let Some(teardown) = self.terminate(TaskPhase::Cancelled) else {
            return;
        };
        tracing::warn!(task_id = %self.id, "polling task cancelled");
        self.coordinator.handle_cancelled();
        Self::release(teardown, Err(ApiError::Cancelled));
    }
}

/// Stand-in for a task whose token was cancelled before it could start.
struct NeverStarted {
    id: Uuid,
}

impl TaskControl for NeverStarted {
    fn id(&self) -> Uuid {
        self.id
    }

    fn phase(&self) -> TaskPhase {
        TaskPhase::Cancelled
    }

    fn checks(&self) -> u32 {
        0
    }

    fn cancel(&self) {}
}

/// Future resolving to a polling task's result. Dropping it unresolved
/// cancels the task.
#[must_use = "futures do nothing unless polled"]
pub struct PollingFuture<T> {
    task: PollingTask,
    receiver: oneshot::Receiver<Result<T, ApiError>>,
    token: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
    resolved: bool,
}

impl<T> PollingFuture<T> {
    fn new(
        task: PollingTask,
        receiver: oneshot::Receiver<Result<T, ApiError>>,
        token: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
    ) -> Self {
        Self {
            task,
            receiver,
            token,
            resolved: false,
        }
    }

    pub fn task(&self) -> &PollingTask {
        &self.task
    }
}

impl<T> Future for PollingFuture<T> {
    type Output = Result<T, ApiError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(token) = this.token.as_mut() {
            if token.as_mut().poll(cx).is_ready() {
                this.token = None;
                this.task.cancel();
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

impl<T> Drop for PollingFuture<T> {
    fn drop(&mut self) {
        if !self.resolved {
            self.task.cancel();
        }
    }
}
