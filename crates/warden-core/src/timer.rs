//! Owned periodic timers.
//!
//! Every recurring activity in the runtime (the bus processing tick, agent
//! heartbeats, self-triggered recurring tasks) runs through a
//! `ScheduledTask`. Whoever starts one holds its handle and cancels it on
//! stop; dropping the handle cancels it too.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A background loop calling `tick` once per `period` until cancelled.
///
/// The first call happens one full period after creation.
pub struct ScheduledTask {
    name: String,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    /// Start a timer on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// If called outside a tokio runtime. Use `every_on` from other threads.
    pub fn every<F>(name: impl Into<String>, period: Duration, tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self::every_on(&Handle::current(), name, period, tick)
    }

    /// Start a timer on `runtime`. Callable from any thread.
    pub fn every_on<F>(
        runtime: &Handle,
        name: impl Into<String>,
        period: Duration,
        mut tick: F,
    ) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let name = name.into();
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let loop_name = name.clone();
        let period = period.max(Duration::from_millis(1));

        let handle = runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => tick(),
                }
            }

            debug!(timer = %loop_name, "scheduled task stopped");
        });

        Self {
            name,
            token,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop future ticks. A tick already running finishes.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel and wait for the loop to exit.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("name", &self.name)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn ticks_until_cancelled() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let timer = ScheduledTask::every("test", Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(75)).await;
        timer.shutdown().await;
        let after_stop = count.load(Ordering::SeqCst);
        assert!(after_stop >= 2, "expected several ticks, got {after_stop}");

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn first_tick_waits_one_period() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let timer = ScheduledTask::every("slow", Duration::from_millis(200), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        timer.cancel();
        assert!(timer.is_cancelled());
    }

    #[tokio::test]
    async fn drop_cancels() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let timer = ScheduledTask::every("dropped", Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(timer);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn every_on_starts_from_a_plain_thread() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let runtime = Handle::current();
        let timer = std::thread::spawn(move || {
            ScheduledTask::every_on(&runtime, "remote", Duration::from_millis(10), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
        .join()
        .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        timer.shutdown().await;
        assert!(count.load(Ordering::SeqCst) >= 1);
    }
}
