//! Background heartbeat driver.

use crate::coordinator::SyncCoordinator;
use crate::transport::HubTransport;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Runs `heartbeat` and `poll` on a shared coordinator every `interval`
/// until `shutdown` turns true or its sender is dropped.
///
/// The coordinator lock is only held for the duration of one round.
pub fn spawn_heartbeat<T>(
    coordinator: Arc<Mutex<SyncCoordinator<T>>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    T: HubTransport + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("heartbeat started every {:?}", interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let mut coordinator = coordinator.lock();
                    if let Err(e) = coordinator.heartbeat() {
                        warn!("heartbeat failed: {}", e);
                    }
                    if let Err(e) = coordinator.poll() {
                        warn!("poll failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("heartbeat stopped");
    })
}
