//! Run/stop lifecycle shared by the background loops.

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lifecycle state of a background loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Not running, either because it never started or because it finished.
    Stopped,

    /// Running.
    Running,

    /// Asked to stop, but still finishing in-flight work.
    Stopping,
}

/// Single-use lifecycle: `Stopped -> Running -> Stopping -> Stopped`.
///
/// Once stopped, a lifecycle cannot be started again. Stopping is idempotent, and stopping a lifecycle that never
/// started prevents it from starting later.
pub(crate) struct Lifecycle {
    name: &'static str,
    shutdown: CancellationToken,
    state: watch::Sender<LifecycleState>,
}

impl Lifecycle {
    pub fn new(name: &'static str) -> Self {
        Self::with_token(name, CancellationToken::new())
    }

    fn with_token(name: &'static str, shutdown: CancellationToken) -> Self {
        let (state, _) = watch::channel(LifecycleState::Stopped);
        Self { name, shutdown, state }
    }

    /// Creates a lifecycle that is also stopped whenever this one is.
    pub fn child(&self, name: &'static str) -> Self {
        Self::with_token(name, self.shutdown.child_token())
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Transitions from `Stopped` to `Running`, returning `None` if the lifecycle already ran or is running.
    ///
    /// The lifecycle goes back to `Stopped` when the returned guard is dropped, including when the running future is
    /// dropped before completing.
    pub fn try_start(&self) -> Option<Running<'_>> {
        let started = self.state.send_if_modified(|state| {
            if *state == LifecycleState::Stopped && !self.shutdown.is_cancelled() {
                *state = LifecycleState::Running;
                true
            } else {
                false
            }
        });

        if !started {
            warn!(component = self.name, state = ?self.state(), "Refusing to start: already running or stopped.");
            return None;
        }
        Some(Running { lifecycle: self })
    }

    /// Signals the loop to stop. Does not wait for it to finish.
    pub fn stop(&self) {
        self.shutdown.cancel();
        let stopping = self.state.send_if_modified(|state| {
            if *state == LifecycleState::Running {
                *state = LifecycleState::Stopping;
                true
            } else {
                false
            }
        });

        if stopping {
            debug!(component = self.name, "Stop requested.");
        }
    }

    /// Resolves once a stop has been requested, for this lifecycle or a parent.
    pub async fn cancelled(&self) {
        self.shutdown.cancelled().await
    }

    /// Resolves once the lifecycle is `Stopped`.
    pub async fn wait_stopped(&self) {
        let mut state_rx = self.state.subscribe();
        let _ = state_rx.wait_for(|state| *state == LifecycleState::Stopped).await;
    }
}

/// Marks a lifecycle as running for as long as it is held.
pub(crate) struct Running<'a> {
    lifecycle: &'a Lifecycle,
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        // Runs whether the loop returned or its future was dropped mid-run.
        self.lifecycle.shutdown.cancel();
        self.lifecycle.state.send_replace(LifecycleState::Stopped);
    }
}
