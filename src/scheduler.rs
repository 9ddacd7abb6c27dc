use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Cancellation handle for a recurring task started by [`schedule`].
///
/// Teardown paths call [`cancel`](PollHandle::cancel) before closing the
/// channel the task feeds; dropping the handle cancels too, so a handle
/// that goes out of scope cannot leave a timer running.
#[derive(Debug)]
pub struct PollHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PollHandle {
    /// Stop future ticks. An in-flight cycle finishes; no new cycle
    /// starts after this call returns.
    pub fn cancel(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Run `task` every `period` until the returned handle is cancelled or
/// dropped. The first run fires immediately. Ticks missed while a cycle
/// runs long are skipped, not replayed.
pub fn schedule<F, Fut>(period: Duration, mut task: F) -> PollHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                // Shutdown wins when both are ready.
                biased;
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => task().await,
            }
        }
    });
    PollHandle {
        shutdown,
        task: handle,
    }
}
