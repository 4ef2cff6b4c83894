use std::future::Future;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// An owned background task that runs a callback on a fixed period.
///
/// Stopping never cancels a callback that is already running: the task only checks for the
/// stop signal between ticks. Stopping is idempotent and safe on a task that never started.
/// Dropping the handle stops the task.
#[derive(Debug, Default)]
pub struct IntervalTask {
    handle: Option<JoinHandle<()>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl IntervalTask {
    /// A handle with no task running.
    pub fn idle() -> Self {
        Self::default()
    }

    /// Starts calling `tick` every `period`, replacing any task already running.
    /// The first call happens one full period after start.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<F, Fut>(&mut self, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.stop();
        let (shutdown, mut stopped) = oneshot::channel::<()>();
        self.shutdown = Some(shutdown);
        self.handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stopped => break,
                    _ = interval.tick() => tick().await,
                }
            }
        }));
    }

    /// Signals the task to stop without waiting for it. A tick in progress runs to completion
    /// in the background.
    pub fn stop(&mut self) {
        self.shutdown.take();
        self.handle.take();
    }

    /// Signals the task to stop and waits until a tick in progress, if any, has finished.
    pub async fn shutdown(mut self) {
        self.shutdown.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    /// Whether a task was started and has not been stopped.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }
}

impl Drop for IntervalTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_ticks_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut task = IntervalTask::idle();
        assert!(!task.is_running());

        let c = count.clone();
        task.start(Duration::from_millis(10), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(task.is_running());

        tokio::time::sleep(Duration::from_millis(80)).await;
        task.stop();
        assert!(!task.is_running());

        // Give a tick that was already running a chance to land.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several ticks, got {}", seen);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut task = IntervalTask::idle();
        task.stop();
        task.stop();
        assert!(!task.is_running());

        task.start(Duration::from_secs(60), || async {});
        task.stop();
        task.stop();
        assert!(!task.is_running());
        IntervalTask::idle().shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_running_tick() {
        let done = Arc::new(AtomicBool::new(false));
        let mut task = IntervalTask::idle();

        let d = done.clone();
        task.start(Duration::from_millis(10), move || {
            let d = d.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(60)).await;
                d.store(true, Ordering::SeqCst);
            }
        });

        // The first tick is now sleeping.
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(!done.load(Ordering::SeqCst));
        task.shutdown().await;
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stop_does_not_cancel_running_tick() {
        let done = Arc::new(AtomicBool::new(false));
        let mut task = IntervalTask::idle();

        let d = done.clone();
        task.start(Duration::from_millis(10), move || {
            let d = d.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(40)).await;
                d.store(true, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(25)).await;
        task.stop();
        assert!(!task.is_running());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(done.load(Ordering::SeqCst));
    }
}
