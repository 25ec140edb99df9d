//! Pause / resume / abort signalling between the API and a running session.
//!
//! Pause is cooperative: the session notices it at its next checkpoint.
//! Abort interrupts the in-flight call at once and then holds the session
//! like a pause. Both end with `resume`. Releasing a session ends its task
//! for good.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Requested run state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Paused,
    /// The in-flight call was cancelled; held until resumed.
    Aborted,
}

/// API side: held by the coordinator, one per live session.
#[derive(Debug)]
pub(crate) struct SessionControl {
    run: watch::Sender<RunState>,
    release: CancellationToken,
}

/// Session side: observed by the session task at its checkpoints.
#[derive(Debug, Clone)]
pub(crate) struct RunSignal {
    run: watch::Receiver<RunState>,
    release: CancellationToken,
}

impl SessionControl {
    pub(crate) fn new() -> (Self, RunSignal) {
        let (tx, rx) = watch::channel(RunState::Running);
        let release = CancellationToken::new();
        let signal = RunSignal {
            run: rx,
            release: release.clone(),
        };
        (Self { run: tx, release }, signal)
    }

    /// Has no effect on an aborted session, which is already held.
    pub(crate) fn pause(&self) {
        self.run.send_if_modified(|state| {
            if *state == RunState::Running {
                *state = RunState::Paused;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn resume(&self) {
        self.run.send_replace(RunState::Running);
    }

    pub(crate) fn abort(&self) {
        self.run.send_replace(RunState::Aborted);
    }

    /// End the session task. Cannot be undone.
    pub(crate) fn release(&self) {
        self.release.cancel();
    }

    pub(crate) fn state(&self) -> RunState {
        *self.run.borrow()
    }
}

impl RunSignal {
    /// Whether the session should hold at its next checkpoint.
    pub(crate) fn is_paused(&self) -> bool {
        *self.run.borrow() != RunState::Running
    }

    /// Released, or nobody is left to resume the session.
    pub(crate) fn is_released(&self) -> bool {
        self.release.is_cancelled() || self.run.has_changed().is_err()
    }

    /// Resolves when the in-flight call must stop: on abort or release.
    pub(crate) async fn interrupted(&self) {
        let mut run = self.run.clone();
        tokio::select! {
            _ = self.release.cancelled() => {}
            _ = run.wait_for(|state| *state == RunState::Aborted) => {}
        }
    }

    /// Block until resumed. Returns `true` if the session was released
    /// instead.
    pub(crate) async fn wait_until_resumed(&mut self) -> bool {
        tokio::select! {
            _ = self.release.cancelled() => true,
            resumed = self.run.wait_for(|state| *state == RunState::Running) => resumed.is_err(),
        }
    }
}
