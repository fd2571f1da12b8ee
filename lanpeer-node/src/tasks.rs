//! Supervised periodic tasks: a failing iteration is logged and the loop keeps going.

use std::future::Future;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::warn;

/// Failure of one iteration of a periodic task.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("send failed: {0}")]
    Send(#[from] std::io::Error),
}

/// Run `step` every `period`, forever. The first run happens immediately.
pub async fn run_periodic<F>(name: &'static str, period: Duration, mut step: F)
where
    F: FnMut() -> Result<(), TaskError>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(e) = step() {
            warn!(task = name, error = %e, "periodic task iteration failed");
        }
    }
}

/// Spawn a periodic task on the current runtime.
pub fn spawn_periodic<F>(name: &'static str, period: Duration, step: F) -> tokio::task::JoinHandle<()>
where
    F: FnMut() -> Result<(), TaskError> + Send + 'static,
{
    spawn_named(name, run_periodic(name, period, step))
}

/// Spawn a long-lived task; log if it ever ends, since none of them should.
pub fn spawn_named<Fut>(name: &'static str, fut: Fut) -> tokio::task::JoinHandle<()>
where
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        fut.await;
        warn!(task = name, "task exited");
    })
}
