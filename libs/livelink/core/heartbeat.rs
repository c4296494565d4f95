//! Heartbeat ticker for an open connection
//!
//! # Architecture
//!
//! Each connection epoch gets its own ticker task:
//!
//! ```text
//! ┌─────────────────────┐
//! │  Heartbeat Task     │
//! │  (Tokio spawn)      │
//! │                     │
//! │  Every interval:    │
//! │  1. Wait for tick   │
//! │  2. Send epoch   ───┼──> mpsc ──> Connection driver ──> ping{seq} ──> Transport
//! │  3. Repeat          │
//! └─────────────────────┘
//! ```
//!
//! The driver owns the [`PingTracker`](crate::core::pong_tracker::PingTracker)
//! that numbers the pings and watches the pong deadline; the task only keeps
//! time. Dropping the [`HeartbeatTask`] stops the ticker at once, so no tick
//! outlives the epoch it was started for.

use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

/// Default interval between pings
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default time a pong may take before the connection is declared dead
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Ticker loop
///
/// Skips the immediate first tick, then forwards `epoch` on every interval
/// until shutdown is signalled or the receiver goes away.
pub async fn heartbeat_task(
    interval: Duration,
    epoch: u64,
    tick_tx: mpsc::UnboundedSender<u64>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    // Slow drivers get one ping per interval, never a burst
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    debug!(epoch, "Heartbeat task started with interval: {:?}", interval);

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!(epoch, "Heartbeat task received shutdown signal");
                break;
            }
            _ = ticker.tick() => {
                if tick_tx.send(epoch).is_err() {
                    debug!(epoch, "Heartbeat channel closed, shutting down heartbeat task");
                    break;
                }
            }
        }
    }

    debug!(epoch, "Heartbeat task exiting");
}

/// Handle to a running ticker; stops it when dropped
pub struct HeartbeatTask {
    handle: JoinHandle<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    tick_rx: mpsc::UnboundedReceiver<u64>,
}

impl HeartbeatTask {
    /// Wait for the next tick; yields the epoch the ticker was started for
    pub async fn tick(&mut self) -> Option<u64> {
        self.tick_rx.recv().await
    }
}

impl Drop for HeartbeatTask {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        self.handle.abort();
    }
}

/// Spawn a heartbeat ticker for `epoch`
///
/// Must be called from within a Tokio runtime.
pub fn spawn_heartbeat(interval: Duration, epoch: u64) -> HeartbeatTask {
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let (tick_tx, tick_rx) = mpsc::unbounded_channel();

    let handle = tokio::spawn(heartbeat_task(interval, epoch, tick_tx, shutdown_rx));

    HeartbeatTask {
        handle,
        shutdown_tx: Some(shutdown_tx),
        tick_rx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ticks_carry_epoch() {
        let mut task = spawn_heartbeat(Duration::from_millis(20), 7);
        let tick = tokio::time::timeout(Duration::from_secs(1), task.tick())
            .await
            .expect("tick within a second");
        assert_eq!(tick, Some(7));
    }

    #[tokio::test]
    async fn test_first_tick_waits_for_interval() {
        let mut task = spawn_heartbeat(Duration::from_millis(200), 1);
        let early = tokio::time::timeout(Duration::from_millis(50), task.tick()).await;
        assert!(early.is_err(), "no tick before the first interval elapses");
    }

    #[tokio::test]
    async fn test_stop_ends_task() {
        let (tick_tx, mut tick_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(heartbeat_task(
            Duration::from_millis(10),
            3,
            tick_tx,
            shutdown_rx,
        ));

        assert_eq!(tick_rx.recv().await, Some(3));
        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("task exits after shutdown")
            .unwrap();
    }
}
