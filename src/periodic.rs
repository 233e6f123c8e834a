use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Spawns a loop that runs `work` every `period` until `cancel` fires.
///
/// The first run happens one period after spawning. A failed run is logged
/// under `name` and the loop keeps going. Cancellation is observed between
/// runs; a run that is already in flight finishes on its own timeouts.
pub fn spawn<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut work: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(task = name, period_secs = period.as_secs_f64(), "periodic task started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = work().await {
                        tracing::warn!(task = name, error = %format!("{:#}", err), "periodic task iteration failed");
                    }
                }
            }
        }
        tracing::debug!(task = name, "periodic task stopped");
    })
}
