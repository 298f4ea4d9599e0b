//! Cancellable periodic liveness signal.
//!
//! A handler may run for an unbounded time while its consumer must keep
//! proving it is alive. `HeartbeatTimer` runs an async action on a fixed
//! delay until stopped, and can fire the action once on demand so a final
//! signal goes out right before control returns to the consume loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::trace;

/// The liveness action fired by the timer.
pub type HeartbeatAction = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`HeartbeatAction`].
pub fn heartbeat_action<F, Fut>(f: F) -> HeartbeatAction
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move || -> BoxFuture<'static, ()> { Box::pin(f()) })
}

/// One started run of the loop. Each run owns its own flag so a restart
/// never revives a loop that was already told to stop.
struct Run {
    active: Arc<AtomicBool>,
    wake: Arc<Notify>,
    _task: JoinHandle<()>,
}

/// Restartable, self-rescheduling periodic task.
pub struct HeartbeatTimer {
    action: HeartbeatAction,
    interval: Duration,
    run: Mutex<Option<Run>>,
}

impl HeartbeatTimer {
    /// Create a stopped timer.
    pub fn new(action: HeartbeatAction, interval: Duration) -> Self {
        Self {
            action,
            interval,
            run: Mutex::new(None),
        }
    }

    /// Start the loop: fire, wait, repeat while running.
    ///
    /// Returns `false` if the timer was already running.
    pub fn start(&self) -> bool {
        let mut run = self.run.lock().unwrap_or_else(|e| e.into_inner());
        if run.as_ref().is_some_and(|r| r.active.load(Ordering::Acquire)) {
            return false;
        }

        let active = Arc::new(AtomicBool::new(true));
        let wake = Arc::new(Notify::new());
        let task = tokio::spawn(Self::cycle(
            Arc::clone(&self.action),
            self.interval,
            Arc::clone(&active),
            Arc::clone(&wake),
        ));

        *run = Some(Run {
            active,
            wake,
            _task: task,
        });
        true
    }

    async fn cycle(
        action: HeartbeatAction,
        interval: Duration,
        active: Arc<AtomicBool>,
        wake: Arc<Notify>,
    ) {
        while active.load(Ordering::Acquire) {
            (action)().await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = wake.notified() => {}
            }
        }
        trace!("Heartbeat loop exited");
    }

    /// Stop the loop. An action already in flight completes; no further one starts.
    pub fn stop(&self) {
        let mut run = self.run.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(run) = run.take() {
            run.active.store(false, Ordering::Release);
            // notify_one keeps a permit, so a loop that is not yet waiting still wakes
            run.wake.notify_one();
        }
    }

    /// Fire the action once right now, independent of the schedule.
    pub async fn force_execution(&self) {
        (self.action)().await;
    }

    pub fn is_running(&self) -> bool {
        self.run
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|r| r.active.load(Ordering::Acquire))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Drop for HeartbeatTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
