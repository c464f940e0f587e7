use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

/// Releases the wake assurance when dropped, so every teardown path —
/// including a panicking worker — gives the resource back.
pub struct WakeGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl WakeGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self { release: Some(Box::new(release)) }
    }

    pub fn noop() -> Self {
        Self { release: None }
    }
}

impl Drop for WakeGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for WakeGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WakeGuard")
    }
}

/// The platform keep-alive contract the supervisor requests but does not
/// implement: an exclusive wake assurance for a bounded window, and a
/// deferred-execution facility that re-invokes start after a delay.
pub trait KeepAlive: Send + Sync + 'static {
    fn acquire_wake(&self, window: Duration) -> WakeGuard;
    fn schedule_restart(&self, delay: Duration);
}

/// In-process implementation: restart triggers are delivered on a channel
/// the host wires back into [`Supervisor::restart`](crate::Supervisor).
pub struct TimerKeepAlive {
    restart_tx: mpsc::UnboundedSender<()>,
}

impl TimerKeepAlive {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<()>) {
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();
        (Arc::new(Self { restart_tx }), restart_rx)
    }
}

impl KeepAlive for TimerKeepAlive {
    fn acquire_wake(&self, window: Duration) -> WakeGuard {
        debug!("svc: wake assurance acquired for {:?}", window);
        WakeGuard::new(|| debug!("svc: wake assurance released"))
    }

    fn schedule_restart(&self, delay: Duration) {
        let tx = self.restart_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(());
        });
    }
}
