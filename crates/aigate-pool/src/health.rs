use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::pool::ProviderPool;

/// Periodic sweep that asks the pool to re-check unhealthy credentials.
///
/// The task is registered with the pool, so `destroy` tears it down with the
/// other timers.
pub fn spawn_health_scheduler(pool: &Arc<ProviderPool>, run_initial_check: bool) {
    let interval = Duration::from_millis(pool.settings().health_check_interval_ms.max(1));
    let task = {
        let pool = pool.clone();
        tokio::spawn(async move {
            if run_initial_check {
                debug!("running initial health check sweep");
                pool.perform_health_checks(true).await;
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so the initial
            // sweep is not doubled.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                pool.perform_health_checks(false).await;
            }
        })
    };
    pool.register_task(task);
}
