use std::{sync::Arc, time::Duration};

use chrono::Utc;
use log::{info, warn};
use tokio::time::MissedTickBehavior;

use crate::pool::{AllocationError, PoolManager};

#[derive(Debug, Clone, Copy)]
pub struct SweeperConfig {
    /// how long a provisional allocation may wait for confirmation
    pub wait_time: chrono::Duration,
    /// shorter than `wait_time`, so a provisional allocation is gone at most
    /// `wait_time + interval` after it was made
    pub interval: Duration,
}

/// Periodically reclaims provisional allocations whose objects never showed
/// up on the cluster. Runs until the pool's epoch ends.
pub async fn run_sweeper(pool: Arc<PoolManager>, config: SweeperConfig) {
    info!(
        "Starting reclamation sweeper (wait time: {}s, interval: {:?})...",
        config.wait_time.num_seconds(),
        config.interval
    );

    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = pool.epoch().ended() => break,
        }

        match pool.sweep(Utc::now(), config.wait_time).await {
            Ok(reclaimed) => {
                for record in reclaimed {
                    info!(
                        "Reclaimed {} address of {} that was never confirmed (transaction {})!",
                        record.address, record.owner, record.transaction
                    );
                }
            }
            Err(AllocationError::StaleEpoch) => break,
            Err(err) => warn!("Reclamation sweep failed, retrying next cycle! {err}"),
        }
    }

    info!("Exiting reclamation sweeper!");
}
