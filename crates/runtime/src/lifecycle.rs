//! Process lifecycle: `Starting → Ready → Draining → Stopped`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::error::LifecycleError;

/// Lifecycle state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Starting,
    Ready,
    Draining,
    Stopped,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// How a drain finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every in-flight dispatch completed within the grace period.
    Completed,
    /// The grace period expired and remaining dispatches were cancelled.
    Forced,
}

/// Shared handle on the process lifecycle.
///
/// Cloning is cheap; all clones observe the same state. In-flight work is
/// spawned through [`Lifecycle::spawn`] so a drain can wait for it.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: watch::Sender<State>,
    shutdown: CancellationToken,
    terminate: CancellationToken,
    tracker: TaskTracker,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(State::Starting);
        Self {
            inner: Arc::new(Inner {
                state,
                shutdown: CancellationToken::new(),
                terminate: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn state(&self) -> State {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.inner.state.subscribe()
    }

    /// True only while `Ready`.
    pub fn is_accepting(&self) -> bool {
        self.state() == State::Ready
    }

    /// Cancelled when draining begins. Listeners stop accepting connections.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Cancelled when the grace period expires or the drain finishes. Session
    /// tokens derive from it, so firing it ends every session and cancels
    /// whatever dispatch is still running.
    pub fn terminate_token(&self) -> CancellationToken {
        self.inner.terminate.clone()
    }

    /// Spawn tracked in-flight work.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.tracker.spawn(task)
    }

    /// Number of tracked tasks still running.
    pub fn in_flight(&self) -> usize {
        self.inner.tracker.len()
    }

    pub fn mark_ready(&self) -> Result<(), LifecycleError> {
        self.transition(State::Ready)
    }

    /// Enter `Draining` and signal listeners. Idempotent once draining.
    pub fn begin_drain(&self) -> Result<(), LifecycleError> {
        if self.state() == State::Draining {
            return Ok(());
        }
        self.transition(State::Draining)?;
        self.inner.shutdown.cancel();
        Ok(())
    }

    /// Drain in-flight work for up to `grace`, force-cancel the rest, then stop.
    pub async fn drain(&self, grace: Duration) -> Result<DrainOutcome, LifecycleError> {
        self.begin_drain()?;
        self.inner.tracker.close();
        info!(in_flight = self.in_flight(), ?grace, "draining");

        let outcome = match tokio::time::timeout(grace, self.inner.tracker.wait()).await {
            Ok(()) => DrainOutcome::Completed,
            Err(_) => {
                warn!(
                    in_flight = self.in_flight(),
                    "grace period expired, cancelling in-flight requests"
                );
                self.inner.terminate.cancel();
                self.inner.tracker.wait().await;
                DrainOutcome::Forced
            }
        };
        self.inner.terminate.cancel();

        self.transition(State::Stopped)?;
        info!("stopped");
        Ok(outcome)
    }

    /// Stop without draining, e.g. after a fatal startup failure.
    pub fn abort(&self) {
        self.inner.shutdown.cancel();
        self.inner.terminate.cancel();
        self.inner.tracker.close();
        self.inner.state.send_replace(State::Stopped);
    }

    fn transition(&self, to: State) -> Result<(), LifecycleError> {
        let mut result = Ok(());
        self.inner.state.send_if_modified(|current| {
            if to > *current {
                *current = to;
                true
            } else {
                result = Err(LifecycleError::InvalidTransition {
                    from: current.to_string(),
                    to: to.to_string(),
                });
                false
            }
        });
        if result.is_ok() {
            info!(state = %to, "lifecycle transition");
        }
        result
    }
}
