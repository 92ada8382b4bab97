//! Stream session: the lifecycle of one task stream connection.
//!
//! The session is transport-agnostic: it reads envelopes from any `Stream` and
//! writes them to an `mpsc::Sender`. The WebSocket adapter in `server` bridges
//! a socket into this shape.
//!
//! State machine:
//! - `Open`: reading envelopes, dispatching assignments without waiting on them
//! - `Draining`: no more reads; in-flight work finishes, or is cancelled and
//!   abandoned after the grace period
//! - `Closed`: every assignment task has been joined or aborted

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::{AbandonedError, ExecutionError, SessionError};
use crate::executor::Executor;
use crate::handler::TaskContext;
use crate::protocol::{
    ActivityRef, Capabilities, Completion, Envelope, Hello, Inbound, TaskAssignment,
};

/// Cadences beyond this never tick during a handler's lifetime.
const MAX_HEARTBEAT: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Draining,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Draining => write!(f, "draining"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Per-session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub worker_id: String,
    pub tags: Vec<String>,
    pub drain_grace: Duration,
}

impl From<&WorkerConfig> for SessionConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            worker_id: config.worker_id.clone(),
            tags: config.tags.clone(),
            drain_grace: config.drain_grace,
        }
    }
}

/// What a finished session reports to its supervisor.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Assignments whose task ran to the end (completion handed to the writer).
    pub completed: usize,
    /// Assignments dropped at the end of the drain grace period.
    pub abandoned: Vec<AbandonedError>,
}

#[derive(Debug, Clone, Copy)]
enum DrainTrigger {
    Shutdown,
    InboundClosed,
}

/// One task stream connection.
pub struct Session {
    id: Uuid,
    executor: Arc<Executor>,
    config: SessionConfig,
    shutdown: CancellationToken,
    state: watch::Sender<SessionState>,
    started_at: DateTime<Utc>,
}

impl Session {
    /// Create a session. Cancelling `shutdown` moves it to `Draining`.
    pub fn new(executor: Arc<Executor>, config: SessionConfig, shutdown: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            executor,
            config,
            shutdown,
            state: watch::Sender::new(SessionState::Open),
            started_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Observe state transitions; the receiver outlives `run`.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn transition(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(session_id = %self.id, from = %previous, to = %next, "Session state changed");
        }
    }

    /// Drive the session to completion.
    ///
    /// Returns `Err` only for plumbing failures (inbound read error, outbound
    /// closed); in-flight work is aborted in that case.
    pub async fn run<S>(
        self,
        mut inbound: S,
        outbound: mpsc::Sender<Envelope>,
    ) -> Result<SessionSummary, SessionError>
    where
        S: Stream<Item = Result<Inbound, SessionError>> + Unpin,
    {
        info!(session_id = %self.id, "Session open");

        // Handlers observe this; it also fires on every exit path.
        let cancel = self.shutdown.child_token();
        let _cancel_on_exit = cancel.clone().drop_guard();
        let mut in_flight = InFlight::new(outbound.clone());

        if let Err(e) = self.greet(&outbound).await {
            self.transition(SessionState::Closed);
            return Err(e);
        }

        let trigger = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break DrainTrigger::Shutdown,
                _ = outbound.closed() => {
                    self.transition(SessionState::Closed);
                    warn!(session_id = %self.id, "Outbound stream closed, aborting in-flight work");
                    return Err(SessionError::Write("outbound stream closed".to_string()));
                }
                frame = inbound.next() => match frame {
                    Some(Ok(item)) => {
                        if let Err(e) = self.dispatch(item, &mut in_flight, &outbound, &cancel).await {
                            self.transition(SessionState::Closed);
                            return Err(e);
                        }
                    }
                    Some(Err(e)) => {
                        self.transition(SessionState::Closed);
                        warn!(session_id = %self.id, error = %e, "Inbound stream failed, aborting in-flight work");
                        return Err(e);
                    }
                    None => break DrainTrigger::InboundClosed,
                },
                Some(joined) = in_flight.tasks.join_next_with_id() => in_flight.reap(joined).await,
            }
        };

        self.transition(SessionState::Draining);
        info!(
            session_id = %self.id,
            trigger = ?trigger,
            in_flight = in_flight.len(),
            "Session draining"
        );

        // Half-close lets work finish on its own; shutdown or a dead writer
        // still bounds the wait.
        let interrupted = match trigger {
            DrainTrigger::Shutdown => true,
            DrainTrigger::InboundClosed => tokio::select! {
                _ = in_flight.drain() => false,
                _ = self.shutdown.cancelled() => true,
                _ = outbound.closed() => true,
            },
        };

        let mut abandoned = Vec::new();
        if interrupted {
            cancel.cancel();
            let grace = self.config.drain_grace;
            if tokio::time::timeout(grace, in_flight.drain()).await.is_err() {
                abandoned = in_flight.abandon(grace).await;
                for e in &abandoned {
                    warn!(session_id = %self.id, error = %e, "Abandoned in-flight assignment");
                }
            }
        }

        self.transition(SessionState::Closed);
        info!(
            session_id = %self.id,
            completed = in_flight.completed,
            abandoned = abandoned.len(),
            "Session closed"
        );

        Ok(SessionSummary {
            session_id: self.id,
            started_at: self.started_at,
            completed: in_flight.completed,
            abandoned,
        })
    }

    async fn greet(&self, outbound: &mpsc::Sender<Envelope>) -> Result<(), SessionError> {
        send(
            outbound,
            Envelope::Hello(Hello {
                worker_id: Some(self.config.worker_id.clone()),
            }),
        )
        .await?;
        send(
            outbound,
            Envelope::Capabilities(Capabilities {
                max_concurrency: u32::try_from(self.executor.max_concurrency())
                    .unwrap_or(u32::MAX),
                tags: self.config.tags.clone(),
            }),
        )
        .await
    }

    async fn dispatch(
        &self,
        inbound: Inbound,
        in_flight: &mut InFlight,
        outbound: &mpsc::Sender<Envelope>,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        match inbound {
            Inbound::Envelope(envelope) => {
                self.handle_envelope(envelope, in_flight, outbound, cancel)
                    .await
            }
            Inbound::MalformedAssign { activity, error } => {
                warn!(
                    session_id = %self.id,
                    activity = %activity,
                    error = %error,
                    "Rejected undecodable assignment"
                );
                let completion = Completion::failure(&activity, format!("Invalid assignment: {error}"));
                send(outbound, Envelope::Completion(completion)).await
            }
            Inbound::Ignored { kind, error } => {
                warn!(session_id = %self.id, kind = %kind, error = %error, "Ignoring undecodable message");
                Ok(())
            }
        }
    }

    async fn handle_envelope(
        &self,
        envelope: Envelope,
        in_flight: &mut InFlight,
        outbound: &mpsc::Sender<Envelope>,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        match envelope {
            Envelope::Hello(hello) => {
                debug!(session_id = %self.id, peer = ?hello.worker_id, "Received hello");
            }
            Envelope::Capabilities(caps) => {
                debug!(
                    session_id = %self.id,
                    max_concurrency = caps.max_concurrency,
                    tags = ?caps.tags,
                    "Received capabilities"
                );
            }
            Envelope::Assign(assignment) => {
                self.accept(assignment, in_flight, outbound, cancel).await?;
            }
            Envelope::Completion(completion) => {
                warn!(
                    session_id = %self.id,
                    activity_id = %completion.activity_id,
                    "Ignoring completion sent by orchestrator"
                );
            }
            Envelope::Progress(progress) => {
                warn!(
                    session_id = %self.id,
                    activity_id = %progress.activity_id,
                    "Ignoring progress sent by orchestrator"
                );
            }
        }
        Ok(())
    }

    async fn accept(
        &self,
        assignment: TaskAssignment,
        in_flight: &mut InFlight,
        outbound: &mpsc::Sender<Envelope>,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        let activity = assignment.activity();
        info!(
            session_id = %self.id,
            activity = %activity,
            task = %assignment.key(),
            "Assignment received"
        );

        if in_flight.contains(&activity) {
            let err = ExecutionError::AlreadyInFlight {
                activity: activity.clone(),
            };
            warn!(session_id = %self.id, error = %err, "Rejected duplicate assignment");
            let completion = Completion::failure(&activity, err.to_string());
            return send(outbound, Envelope::Completion(completion)).await;
        }

        let ctx = TaskContext::new(activity.clone(), cancel.child_token());
        in_flight.spawn(
            activity,
            run_assignment(Arc::clone(&self.executor), assignment, ctx, outbound.clone()),
        );
        Ok(())
    }
}

async fn send(outbound: &mpsc::Sender<Envelope>, envelope: Envelope) -> Result<(), SessionError> {
    outbound
        .send(envelope)
        .await
        .map_err(|_| SessionError::Write("outbound stream closed".to_string()))
}

/// Execute one assignment, emitting progress at its heartbeat cadence until
/// the completion is ready.
async fn run_assignment(
    executor: Arc<Executor>,
    assignment: TaskAssignment,
    ctx: TaskContext,
    outbound: mpsc::Sender<Envelope>,
) {
    let activity = ctx.activity().clone();
    let mut heartbeat = heartbeat_ticker(assignment.heartbeat_interval_s);

    let execution = executor.execute(Arc::new(assignment), ctx.clone());
    tokio::pin!(execution);

    let completion = loop {
        tokio::select! {
            completion = &mut execution => break completion,
            _ = next_tick(&mut heartbeat) => {
                let progress = ctx.progress_snapshot();
                if outbound.send(Envelope::Progress(progress)).await.is_err() {
                    debug!(activity = %activity, "Progress dropped, outbound stream closed");
                }
            }
        }
    };

    if outbound.send(Envelope::Completion(completion)).await.is_err() {
        debug!(activity = %activity, "Completion dropped, outbound stream closed");
    }
}

/// Progress ticker for a heartbeat cadence. `None` when disabled (0) or when
/// the first tick would fall past the clock's range.
fn heartbeat_ticker(interval_s: u64) -> Option<Interval> {
    let period = Duration::from_secs(interval_s);
    if period.is_zero() || period > MAX_HEARTBEAT {
        return None;
    }
    let start = Instant::now().checked_add(period)?;
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(ticker)
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Assignment tasks owned by one session, keyed by task id so a task that
/// dies still releases its activity.
struct InFlight {
    tasks: JoinSet<()>,
    activities: HashMap<Id, ActivityRef>,
    outbound: mpsc::Sender<Envelope>,
    completed: usize,
}

impl InFlight {
    fn new(outbound: mpsc::Sender<Envelope>) -> Self {
        Self {
            tasks: JoinSet::new(),
            activities: HashMap::new(),
            outbound,
            completed: 0,
        }
    }

    fn contains(&self, activity: &ActivityRef) -> bool {
        self.activities.values().any(|running| running == activity)
    }

    fn len(&self) -> usize {
        self.activities.len()
    }

    fn spawn<F>(&mut self, activity: ActivityRef, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = self.tasks.spawn(task);
        self.activities.insert(handle.id(), activity);
    }

    /// Settle one joined task. A task that failed without reporting gets an
    /// ERROR completion; aborted tasks stay listed for `abandon`.
    async fn reap(&mut self, joined: Result<(Id, ()), JoinError>) {
        let (id, failure) = match joined {
            Ok((id, ())) => {
                self.completed += 1;
                (id, None)
            }
            Err(e) if e.is_cancelled() => return,
            Err(e) => (e.id(), Some(e.to_string())),
        };
        let Some(activity) = self.activities.remove(&id) else {
            return;
        };
        if let Some(message) = failure {
            error!(activity = %activity, error = %message, "Assignment task failed");
            let completion =
                Completion::failure(&activity, format!("Assignment task failed: {message}"));
            if self.outbound.send(Envelope::Completion(completion)).await.is_err() {
                debug!(activity = %activity, "Completion dropped, outbound stream closed");
            }
        }
    }

    async fn drain(&mut self) {
        while let Some(joined) = self.tasks.join_next_with_id().await {
            self.reap(joined).await;
        }
    }

    /// Abort whatever is still running. Tasks that finish during the abort are
    /// still counted as completed.
    async fn abandon(&mut self, grace: Duration) -> Vec<AbandonedError> {
        self.tasks.abort_all();
        self.drain().await;
        self.activities
            .drain()
            .map(|(_, activity)| AbandonedError { activity, grace })
            .collect()
    }
}
