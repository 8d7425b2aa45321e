//! Pause / resume / stop signalling for a live run.
//!
//! Signals are only read at item boundaries; setting one never interrupts an
//! adapter call already in flight.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

struct Inner {
    paused: watch::Sender<bool>,
    stop: CancellationToken,
}

/// Cloneable handle to a run's control signals.
#[derive(Clone)]
pub struct RunControl {
    inner: Arc<Inner>,
}

impl RunControl {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                paused,
                stop: CancellationToken::new(),
            }),
        }
    }

    /// Request a pause. Returns `false` if the run was already paused.
    pub fn pause(&self) -> bool {
        self.inner.paused.send_if_modified(|paused| {
            let changed = !*paused;
            *paused = true;
            changed
        })
    }

    /// Lift a pause. Returns `false` if the run was not paused.
    pub fn resume(&self) -> bool {
        self.inner.paused.send_if_modified(|paused| {
            let changed = *paused;
            *paused = false;
            changed
        })
    }

    /// Request a cooperative stop. Also ends a pause wait.
    pub fn stop(&self) {
        self.inner.stop.cancel();
    }

    pub fn is_paused(&self) -> bool {
        *self.inner.paused.borrow()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    /// Wait until the run is resumed or stopped. Returns `true` on resume,
    /// `false` on stop.
    pub async fn wait_while_paused(&self) -> bool {
        let mut rx = self.inner.paused.subscribe();
        tokio::select! {
            biased;
            _ = self.inner.stop.cancelled() => false,
            res = rx.wait_for(|paused| !*paused) => res.is_ok(),
        }
    }
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RunControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunControl")
            .field("paused", &self.is_paused())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pause_and_resume_are_idempotent() {
        let control = RunControl::new();
        assert!(control.pause());
        assert!(!control.pause());
        assert!(control.is_paused());
        assert!(control.resume());
        assert!(!control.resume());
        assert!(!control.is_paused());
    }

    #[tokio::test]
    async fn wait_returns_on_resume() {
        let control = RunControl::new();
        control.pause();
        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.wait_while_paused().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        control.resume();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn stop_ends_pause_wait() {
        let control = RunControl::new();
        control.pause();
        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.wait_while_paused().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        control.stop();
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_when_not_paused_returns_immediately() {
        let control = RunControl::new();
        assert!(control.wait_while_paused().await);
    }
}
