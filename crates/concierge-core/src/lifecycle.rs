//! Graceful shutdown orchestration.
//!
//! `ShutdownHandler::wait_for_shutdown` blocks until either a termination
//! signal arrives or the process context is cancelled by someone else. On a
//! signal it cancels the process, then runs every cleanup task concurrently
//! under one shared deadline and aggregates whatever they report.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::mpsc,
    time::{sleep_until, Instant},
};

use crate::Context;

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type TaskAction = Box<dyn FnOnce(Context) -> TaskFuture + Send>;

/// A named unit of cleanup work.
pub struct ShutdownTask {
    name: String,
    action: TaskAction,
}

impl ShutdownTask {
    pub fn new<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            action: Box::new(move |ctx| Box::pin(action(ctx))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ShutdownTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownTask")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Waiting,
    ShuttingDown,
    Completed,
    TimedOut,
}

/// Kind of OS termination request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    Interrupt,
    Terminate,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Interrupt => f.write_str("SIGINT"),
            Termination::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Anything that can deliver termination requests.
///
/// `None` means the source is exhausted and will never fire again.
#[async_trait]
pub trait TerminationSource: Send {
    async fn recv(&mut self) -> Option<Termination>;
}

/// SIGINT/SIGTERM on unix, ctrl-c elsewhere.
///
/// Handlers are installed on construction and replace the default
/// terminate-the-process behaviour for the rest of the process lifetime.
pub struct OsSignals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl OsSignals {
    pub fn new() -> std::io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            Ok(Self {
                interrupt: signal(SignalKind::interrupt())?,
                terminate: signal(SignalKind::terminate())?,
            })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }
}

#[async_trait]
impl TerminationSource for OsSignals {
    async fn recv(&mut self) -> Option<Termination> {
        #[cfg(unix)]
        {
            tokio::select! {
                v = self.interrupt.recv() => v.map(|_| Termination::Interrupt),
                v = self.terminate.recv() => v.map(|_| Termination::Terminate),
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c()
                .await
                .ok()
                .map(|_| Termination::Interrupt)
        }
    }
}

/// One contributor to a failed shutdown run.
#[derive(Debug)]
pub enum ShutdownFailure {
    Task {
        name: String,
        error: anyhow::Error,
    },
    /// The shared deadline elapsed; `pending` never reported in time.
    TimedOut {
        timeout: Duration,
        pending: Vec<String>,
    },
}

impl fmt::Display for ShutdownFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownFailure::Task { name, error } => write!(f, "{name}: {error:#}"),
            ShutdownFailure::TimedOut { timeout, pending } => write!(
                f,
                "graceful shutdown timeout exceeded after {timeout:?} (pending: {})",
                pending.join(", ")
            ),
        }
    }
}

/// Aggregate of every failure observed during one shutdown run.
#[derive(Debug)]
pub struct ShutdownError {
    pub failures: Vec<ShutdownFailure>,
}

impl ShutdownError {
    /// Names of the tasks that reported an error (timeouts excluded).
    pub fn failed_tasks(&self) -> Vec<&str> {
        self.failures
            .iter()
            .filter_map(|f| match f {
                ShutdownFailure::Task { name, .. } => Some(name.as_str()),
                ShutdownFailure::TimedOut { .. } => None,
            })
            .collect()
    }

    pub fn timed_out(&self) -> bool {
        self.failures
            .iter()
            .any(|f| matches!(f, ShutdownFailure::TimedOut { .. }))
    }
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "graceful shutdown finished with errors: ")?;
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ShutdownError {}

enum Trigger {
    Signal(Termination),
    Context,
}

/// Waits for a termination trigger, then runs cleanup under one deadline.
#[derive(Debug)]
pub struct ShutdownHandler {
    timeout: Duration,
    state: Mutex<RunState>,
}

impl Default for ShutdownHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandler {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_SHUTDOWN_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            state: Mutex::new(RunState::Waiting),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: RunState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Move `from` -> `to` in one step; false if the state was not `from`.
    fn transition(&self, from: RunState, to: RunState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return false;
        }
        *state = to;
        true
    }

    /// Block until a signal or `ctx` cancellation, then shut down.
    ///
    /// Cancellation of `ctx` by anyone else means a shutdown is already in
    /// progress elsewhere: no tasks run and the call succeeds. Only the first
    /// caller to leave `Waiting` runs the tasks; every other call returns
    /// `Ok` without cancelling anything.
    pub async fn wait_for_shutdown<S>(
        &self,
        ctx: &Context,
        mut signals: S,
        cancel: impl FnOnce() + Send,
        tasks: Vec<ShutdownTask>,
    ) -> Result<(), ShutdownError>
    where
        S: TerminationSource,
    {
        if self.state() != RunState::Waiting {
            tracing::warn!(state = ?self.state(), "shutdown handler already used");
            return Ok(());
        }

        match wait_for_trigger(ctx, &mut signals).await {
            Trigger::Context => {
                tracing::info!("context cancelled before shutdown signal");
                self.transition(RunState::Waiting, RunState::Completed);
                return Ok(());
            }
            Trigger::Signal(sig) => {
                tracing::info!(signal = %sig, "shutdown signal received");
            }
        }
        // No further signals are processed once shutdown starts.
        drop(signals);

        if !self.transition(RunState::Waiting, RunState::ShuttingDown) {
            tracing::warn!(state = ?self.state(), "shutdown already started by another caller");
            return Ok(());
        }
        tracing::info!(tasks = tasks.len(), "starting graceful shutdown");
        cancel();

        self.run_tasks(tasks).await
    }

    /// Run every task concurrently under the shared deadline.
    pub(crate) async fn run_tasks(&self, tasks: Vec<ShutdownTask>) -> Result<(), ShutdownError> {
        let deadline = Instant::now() + self.timeout;
        let task_ctx = Context::background().with_deadline(deadline);
        let (tx, mut rx) = mpsc::channel::<(String, anyhow::Result<()>)>(tasks.len().max(1));
        let mut pending: Vec<String> = Vec::with_capacity(tasks.len());

        for task in tasks {
            let ShutdownTask { name, action } = task;
            let tx = tx.clone();
            let ctx = task_ctx.clone();
            pending.push(name.clone());

            tracing::info!(task = %name, "shutdown task started");
            tokio::spawn(async move {
                let outcome = match tokio::spawn(async move { action(ctx).await }).await {
                    Ok(res) => res,
                    Err(e) => Err(anyhow::anyhow!("task panicked: {e}")),
                };
                match &outcome {
                    Ok(()) => tracing::info!(task = %name, "shutdown task completed"),
                    Err(e) => tracing::error!(task = %name, error = %e, "shutdown task failed"),
                }
                // Receiver gone means the run already timed out; the outcome is discarded.
                let _ = tx.send((name, outcome)).await;
            });
        }
        drop(tx);

        let mut failures = Vec::new();
        let timer = sleep_until(deadline);
        tokio::pin!(timer);

        while !pending.is_empty() {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some((name, outcome)) => record(&mut pending, &mut failures, name, outcome),
                    None => {
                        for name in pending.drain(..) {
                            failures.push(ShutdownFailure::Task {
                                name,
                                error: anyhow::anyhow!("task exited without reporting"),
                            });
                        }
                    }
                },
                _ = &mut timer => {
                    while let Ok((name, outcome)) = rx.try_recv() {
                        record(&mut pending, &mut failures, name, outcome);
                    }
                    tracing::error!(timeout = ?self.timeout, pending = ?pending, "graceful shutdown timeout exceeded");
                    failures.push(ShutdownFailure::TimedOut {
                        timeout: self.timeout,
                        pending,
                    });
                    task_ctx.cancel();
                    self.set_state(RunState::TimedOut);
                    return Err(ShutdownError { failures });
                }
            }
        }

        task_ctx.cancel();
        self.set_state(RunState::Completed);

        if failures.is_empty() {
            tracing::info!("graceful shutdown completed successfully");
            Ok(())
        } else {
            let err = ShutdownError { failures };
            tracing::error!(error = %err, "graceful shutdown finished with errors");
            Err(err)
        }
    }
}

async fn wait_for_trigger<S: TerminationSource>(ctx: &Context, signals: &mut S) -> Trigger {
    tokio::select! {
        biased;
        _ = ctx.done() => Trigger::Context,
        sig = signals.recv() => match sig {
            Some(sig) => Trigger::Signal(sig),
            None => {
                // Source exhausted; only cancellation can end the wait now.
                ctx.done().await;
                Trigger::Context
            }
        },
    }
}

fn record(
    pending: &mut Vec<String>,
    failures: &mut Vec<ShutdownFailure>,
    name: String,
    outcome: anyhow::Result<()>,
) {
    if let Some(pos) = pending.iter().position(|p| *p == name) {
        pending.remove(pos);
    }
    if let Err(error) = outcome {
        failures.push(ShutdownFailure::Task { name, error });
    }
}
