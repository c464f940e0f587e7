use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tether_proto::{LocationSample, PositionFix};
use tether_store::SampleUploader;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::keepalive::{KeepAlive, WakeGuard};
use crate::redelivery::{Redelivery, RedeliveryPolicy};
use crate::source::{FixFeed, FixSource, FixSourceError, SamplingPolicy};
use crate::state::{RunStateCell, ServiceRunState};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub child_id: String,
    pub policy: SamplingPolicy,
    /// Window requested for the exclusive wake assurance at task start.
    pub wake_window: Duration,
    /// Self-restart delay after the worker dies without an explicit stop.
    pub restart_delay: Duration,
    /// Restart delay after an external task-removed signal.
    pub task_removed_delay: Duration,
    /// Settle time before starting on a boot trigger, and how long to wait
    /// before double-checking that the start took.
    pub boot_settle: Duration,
    pub boot_recheck: Duration,
    pub redelivery: RedeliveryPolicy,
}

impl SupervisorConfig {
    pub fn new(child_id: impl Into<String>) -> Self {
        Self {
            child_id: child_id.into(),
            policy: SamplingPolicy::default(),
            wake_window: Duration::from_secs(10 * 60),
            restart_delay: Duration::from_secs(2),
            task_removed_delay: Duration::from_secs(1),
            boot_settle: Duration::from_secs(5),
            boot_recheck: Duration::from_secs(10),
            redelivery: RedeliveryPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("sampling subscription failed: {0}")]
    Subscribe(#[from] FixSourceError),
}

/// Owns the sampling loop and the task's run/restart state. Cheap to clone;
/// all clones drive the same service instance.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: SupervisorConfig,
    run_state: RunStateCell,
    source: Arc<dyn FixSource>,
    uploader: Arc<dyn SampleUploader>,
    keepalive: Arc<dyn KeepAlive>,
    worker: Mutex<Option<WorkerHandle>>,
    explicit_stop: AtomicBool,
}

struct WorkerHandle {
    stop_tx: oneshot::Sender<()>,
    monitor: JoinHandle<()>,
}

impl Supervisor {
    pub fn new(
        cfg: SupervisorConfig,
        source: Arc<dyn FixSource>,
        uploader: Arc<dyn SampleUploader>,
        keepalive: Arc<dyn KeepAlive>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                run_state: RunStateCell::new(ServiceRunState::Stopped),
                source,
                uploader,
                keepalive,
                worker: Mutex::new(None),
                explicit_stop: AtomicBool::new(false),
            }),
        }
    }

    pub fn run_state(&self) -> ServiceRunState {
        self.inner.run_state.load()
    }

    /// Idempotent: a start while Starting or Running is a no-op. The service
    /// counts as Running only once the wake assurance is held and the
    /// sampling subscription is established.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        if !self.inner.run_state.try_begin_start() {
            debug!("svc: start ignored; service is {:?}", self.run_state());
            return Ok(());
        }
        info!("svc: starting");
        self.inner.explicit_stop.store(false, Ordering::SeqCst);

        let wake = self.inner.keepalive.acquire_wake(self.inner.cfg.wake_window);
        let feed = match self.inner.source.subscribe(&self.inner.cfg.policy).await {
            Ok(feed) => feed,
            Err(e) => {
                // No escalation: the next restart or boot trigger is
                // expected to succeed eventually. The wake guard drops here.
                warn!("svc: sampling subscription failed: {}", e);
                self.inner.run_state.store(ServiceRunState::Stopped);
                return Err(e.into());
            }
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        let worker = tokio::spawn(sampling_loop(self.inner.clone(), feed, wake, stop_rx));
        // Running is set before the monitor exists, so a worker that dies
        // immediately still counts as an abnormal termination.
        self.inner.run_state.store(ServiceRunState::Running);
        let monitor = tokio::spawn(monitor_worker(self.inner.clone(), worker));
        *self.inner.worker.lock().await = Some(WorkerHandle { stop_tx, monitor });
        info!("svc: running");
        Ok(())
    }

    /// Explicit stop: tears the subscription down, releases the wake
    /// assurance, and arms no restart.
    pub async fn stop(&self) {
        self.inner.explicit_stop.store(true, Ordering::SeqCst);
        let handle = self.inner.worker.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.stop_tx.send(());
            let _ = handle.monitor.await;
        }
        self.inner.run_state.store(ServiceRunState::Stopped);
        info!("svc: stopped");
    }

    /// Entry point for external restart triggers. Ignored once the service
    /// has been explicitly stopped, so a stale timer cannot resurrect it.
    pub async fn restart(&self) {
        if self.inner.explicit_stop.load(Ordering::SeqCst) {
            debug!("svc: restart trigger ignored after explicit stop");
            return;
        }
        if let Err(e) = self.start().await {
            warn!("svc: restart attempt failed: {}", e);
        }
    }

    /// Task-removed signal: arm a short-delay self-restart.
    pub fn notify_task_removed(&self) {
        if self.inner.explicit_stop.load(Ordering::SeqCst) {
            return;
        }
        info!(
            "svc: task removed; arming restart in {:?}",
            self.inner.cfg.task_removed_delay
        );
        self.inner.keepalive.schedule_restart(self.inner.cfg.task_removed_delay);
    }

    /// Boot / package-replaced signal: settle, start, and double-check that
    /// the start took.
    pub async fn notify_boot(&self) {
        info!("svc: boot trigger; settling for {:?}", self.inner.cfg.boot_settle);
        tokio::time::sleep(self.inner.cfg.boot_settle).await;
        if let Err(e) = self.start().await {
            warn!("svc: start after boot failed: {}", e);
        }
        tokio::time::sleep(self.inner.cfg.boot_recheck).await;
        if self.run_state() != ServiceRunState::Running {
            warn!("svc: not running after boot; starting again");
            if let Err(e) = self.start().await {
                warn!("svc: boot restart failed: {}", e);
            }
        }
    }
}

/// Watches the sampling worker. A termination without an explicit stop —
/// cancellation, panic, or an unexpected return — arms the self-restart.
async fn monitor_worker(inner: Arc<Inner>, worker: JoinHandle<()>) {
    let outcome = worker.await;
    if inner.explicit_stop.load(Ordering::SeqCst) {
        return;
    }
    if inner.run_state.load() != ServiceRunState::Running {
        return;
    }
    match outcome {
        Ok(()) => warn!("svc: sampling worker exited unexpectedly"),
        Err(e) if e.is_panic() => warn!("svc: sampling worker panicked"),
        Err(_) => warn!("svc: sampling worker was cancelled"),
    }
    inner.run_state.store(ServiceRunState::Restarting);
    inner.worker.lock().await.take();
    info!("svc: arming self-restart in {:?}", inner.cfg.restart_delay);
    inner.keepalive.schedule_restart(inner.cfg.restart_delay);
}

async fn sampling_loop(
    inner: Arc<Inner>,
    mut feed: Box<dyn FixFeed>,
    wake: WakeGuard,
    mut stop_rx: oneshot::Receiver<()>,
) {
    // Held for the worker's lifetime; dropped (released) on every exit path.
    let _wake = wake;
    let redelivery = Redelivery::new(inner.cfg.redelivery.clone());
    let mut drain = tokio::time::interval_at(
        tokio::time::Instant::now() + inner.cfg.redelivery.drain_interval,
        inner.cfg.redelivery.drain_interval,
    );

    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                debug!("svc: sampling loop stopping");
                return;
            }
            _ = drain.tick() => {
                for entry in redelivery.drain_pending() {
                    spawn_upload(&inner, &redelivery, entry.sample, entry.redispatches + 1);
                }
            }
            result = feed.next_fix() => match result {
                Ok(fix) => dispatch_fix(&inner, &redelivery, fix),
                Err(e) => {
                    warn!("svc: fix feed interrupted: {}", e);
                    match resubscribe(&inner, &mut stop_rx).await {
                        Some(new_feed) => feed = new_feed,
                        None => return,
                    }
                }
            },
        }
    }
}

/// Bounded retry of the *subscription*, distinct from the pipeline's retry
/// of a delivery: wait the fixed interval, subscribe again, repeat until it
/// takes or the service stops.
async fn resubscribe(
    inner: &Arc<Inner>,
    stop_rx: &mut oneshot::Receiver<()>,
) -> Option<Box<dyn FixFeed>> {
    loop {
        tokio::select! {
            _ = &mut *stop_rx => return None,
            _ = tokio::time::sleep(inner.cfg.policy.resubscribe_delay) => {}
        }
        match inner.source.subscribe(&inner.cfg.policy).await {
            Ok(feed) => {
                info!("svc: sampling subscription re-established");
                return Some(feed);
            }
            Err(e) => warn!("svc: resubscribe failed: {}", e),
        }
    }
}

fn dispatch_fix(inner: &Arc<Inner>, redelivery: &Redelivery, fix: PositionFix) {
    let sample = match LocationSample::from_fix(&inner.cfg.child_id, &fix) {
        Ok(sample) => sample,
        Err(e) => {
            warn!("svc: dropping invalid fix: {}", e);
            return;
        }
    };
    debug!("svc: fix at {:.5},{:.5}", sample.latitude, sample.longitude);
    spawn_upload(inner, redelivery, sample, 0);
}

// Delivery runs on its own task so a slow or failing upload never stalls
// fix delivery; an in-flight upload survives a supervisor stop.
fn spawn_upload(
    inner: &Arc<Inner>,
    redelivery: &Redelivery,
    sample: LocationSample,
    redispatches: u32,
) {
    let uploader = inner.uploader.clone();
    let redelivery = redelivery.clone();
    tokio::spawn(async move {
        match uploader.upload(sample.clone()).await {
            Ok(row) => debug!("svc: sample delivered (id {:?})", row.id),
            Err(e) if e.is_retryable() => {
                warn!("svc: delivery failed ({}); queueing for redelivery", e);
                redelivery.push(sample, redispatches);
            }
            Err(e) => warn!("svc: sample dropped after terminal failure: {}", e),
        }
    });
}
