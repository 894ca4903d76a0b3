use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::error::CancelledError;

/// Longest uninterrupted sleep taken by [CancelListener::pause] between checks of the signal.
const PAUSE_SLICE: Duration = Duration::from_millis(100);

/// Owner side of the cancellation signal shared by the orchestrator and its helper threads.
///
/// Cancelling is level-triggered: once [CancelHandle::cancel] has been called every listener,
/// including ones created afterwards, observes the cancelled state.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        Self {
            sender: Arc::new(watch::channel(false).0),
        }
    }

    pub fn cancel(&self) {
        if !self.sender.send_replace(true) {
            log::debug!("Cancellation signal raised");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn new_listener(&self) -> CancelListener {
        CancelListener {
            receiver: self.sender.subscribe(),
        }
    }
}

/// Receiving side of a [CancelHandle].
///
/// A listener whose handle has been dropped reports itself as cancelled, nobody is left to keep
/// the work alive.
#[derive(Debug, Clone)]
pub struct CancelListener {
    receiver: watch::Receiver<bool>,
}

impl CancelListener {
    /// Point in time check, meant to be called once per loop iteration by cooperative workers.
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow() || self.receiver.has_changed().is_err()
    }

    /// Wait until the signal is raised. Safe to race against other futures in a `select!`.
    pub async fn cancelled(&mut self) {
        // An error means the handle is gone, which counts as cancelled.
        let _ = self.receiver.wait_for(|cancelled| *cancelled).await;
    }

    /// Blocking sleep that wakes early with an error if the signal is raised.
    pub fn pause(&self, duration: Duration) -> Result<(), CancelledError> {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return Err(CancelledError::default());
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep((deadline - now).min(PAUSE_SLICE));
        }
    }
}
