//! Background playback scheduler.
//!
//! Ticks at a fixed interval, sweeps heartbeat-silent devices offline, and
//! rotates every online device whose slot is empty, expired, or close enough
//! to expiry that the next content should be staged now. The switch-ahead
//! lookahead keeps devices from going blank between the deadline and the next
//! tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::FleetCore;

/// Timing knobs for the scheduler loop.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerTuning {
    pub poll_interval: Duration,
    /// Rotate when the slot's remaining window drops below this.
    pub switch_ahead: Duration,
    /// Heartbeat silence after which a device is swept offline; `None`
    /// disables the sweep.
    pub offline_after: Option<Duration>,
}

/// One scheduler pass over the fleet. Split out from the loop so tests can
/// drive ticks with a controlled clock-free cadence.
pub fn run_tick(core: &FleetCore, tuning: &SchedulerTuning) {
    let now = Utc::now();

    if let Some(silence) = tuning.offline_after {
        for device_code in core.registry.sweep_offline(silence, now) {
            info!("device {device_code} marked offline after heartbeat silence");
        }
    }

    // Devices are independent; nothing one device does should stall the rest.
    for device_code in core.registry.online_devices() {
        if !core
            .store
            .slot_vacant_or_expiring(&device_code, tuning.switch_ahead, now)
        {
            continue;
        }
        match core.advance_device(&device_code, now) {
            Some(submission) => debug!(
                "scheduler rotated {device_code} to content {}",
                submission.content_id
            ),
            None => {
                // Queue empty: an expired occupant (if any) was purged; the
                // device keeps showing its last content until new submissions
                // arrive.
            }
        }
    }
}

/// Spawn the scheduler loop. Stops when the shutdown signal flips to `true`.
pub fn start(
    core: Arc<FleetCore>,
    tuning: SchedulerTuning,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tuning.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(
            "playback scheduler started (poll {:?}, switch-ahead {:?})",
            tuning.poll_interval, tuning.switch_ahead
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => run_tick(&core, &tuning),
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        info!("playback scheduler stopped");
                        return;
                    }
                }
            }
        }
    })
}
