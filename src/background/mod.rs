//! Background tasks: long-lived periodic jobs with cooperative shutdown.
//!
//! A job registered with [`spawn_periodic`] runs its body once per period,
//! starting one full period after spawn, until its [`CancellationToken`]
//! fires.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Spawns `job` on the Tokio runtime, invoking it every `period`.
///
/// The job body must be quick and must not block: it runs on the runtime's
/// worker threads. Missed ticks (e.g. after the process was suspended) are
/// collapsed into a single invocation rather than replayed.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() {
/// let shutdown = CancellationToken::new();
/// let handle = promptgate::background::spawn_periodic(
///     "heartbeat",
///     Duration::from_secs(30),
///     shutdown.clone(),
///     || tracing::info!("still alive"),
/// );
/// shutdown.cancel();
/// handle.await.ok();
/// # }
/// ```
pub fn spawn_periodic<F>(
    name: &'static str,
    period: Duration,
    shutdown: CancellationToken,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(job = name, ?period, "background job started");

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => job(),
            }
        }

        info!(job = name, "background job stopped");
    })
}
