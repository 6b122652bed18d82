// Generic recurring background task.
//
// Scheduled trigger -> idempotent task body -> reschedule. Task errors
// are logged and the loop keeps running; they never kill the schedule.
// Used for the flush sweep and any cron-like background job.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::warn;

pub fn spawn_recurring<F, Fut>(name: &'static str, interval: Duration, mut task: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval fires immediately; consume the first tick so the
        // task first runs one full interval after spawn.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(error) = task().await {
                warn!(task = name, error = %error, "recurring task failed");
            }
        }
    })
}
