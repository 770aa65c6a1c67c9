//! # Fleet Module - Scheduling Core
//!
//! The coordination layer between the stores and the transport: the submission
//! gateway (admission, enqueue, preemption), the background scheduler that
//! rotates the current slot, the device registry, the visitor quota, and the
//! server that wires everything together.
//!
//! ```text
//!   SubmissionGateway ──┐
//!                       ├──> FleetCore ──> PlayQueueStore / PushLedger
//!   Scheduler tick ─────┘        │
//!                                └──> outbound channel ──> MQTT writer
//! ```

pub mod gateway;
pub mod quota;
pub mod registry;
pub mod scheduler;
pub mod server;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info};
use tokio::sync::mpsc;

use crate::ledger::PushLedger;
use crate::queue::{PlayQueueStore, PlayWindows, Submission};
use crate::transport::{CommandMessage, OutboundCommand};

pub use gateway::{ContentRef, SubmissionGateway, Submitter, SubmitError, SubmitOutcome};
pub use quota::VisitorQuota;
pub use registry::{DeviceRecord, DeviceRegistry};
pub use scheduler::SchedulerTuning;
pub use server::FleetServer;

/// Shared state and the dispatch path, used by both the gateway and the
/// scheduler.
pub struct FleetCore {
    pub store: PlayQueueStore,
    pub ledger: Arc<PushLedger>,
    pub registry: DeviceRegistry,
    pub quota: VisitorQuota,
    pub windows: PlayWindows,
    outbound: mpsc::UnboundedSender<OutboundCommand>,
}

impl FleetCore {
    pub fn new(
        ledger: Arc<PushLedger>,
        windows: PlayWindows,
        visitor_daily_limit: u32,
        outbound: mpsc::UnboundedSender<OutboundCommand>,
    ) -> Self {
        Self {
            store: PlayQueueStore::new(),
            ledger,
            registry: DeviceRegistry::new(),
            quota: VisitorQuota::new(visitor_daily_limit),
            windows,
            outbound,
        }
    }

    /// Pop the next queued submission into the device's slot and dispatch it.
    /// Returns the submission now playing, or `None` when the queue was empty.
    pub fn advance_device(&self, device_code: &str, now: DateTime<Utc>) -> Option<Submission> {
        let submission = self.store.occupy_next(device_code, &self.windows, now)?;
        self.dispatch(device_code, &submission, now);
        Some(submission)
    }

    /// Publish the play command for a submission that just entered the slot
    /// and settle the bookkeeping that goes with a dispatch: the registry's
    /// current-content view and, for visitors, the daily quota charge.
    ///
    /// The artifact comes from the ledger entry written at admission. A
    /// missing entry means the ledger was wiped underneath us; the slot is
    /// cleared so the next tick can move on.
    pub fn dispatch(&self, device_code: &str, submission: &Submission, now: DateTime<Utc>) {
        let entry = match self.ledger.get(&submission.correlation_id) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                error!(
                    "no ledger entry for correlation {}; dropping dispatch to {device_code}",
                    submission.correlation_id
                );
                self.store.clear_slot(device_code);
                return;
            }
            Err(e) => {
                error!(
                    "ledger read failed for correlation {}: {e}; dropping dispatch to {device_code}",
                    submission.correlation_id
                );
                self.store.clear_slot(device_code);
                return;
            }
        };

        let message = CommandMessage {
            kind: submission.content_kind,
            content_id: submission.content_id,
            url: entry.artifact.url,
            size: entry.artifact.size,
            md5: entry.artifact.md5,
            timestamp: now.timestamp_millis(),
            message_id: submission.correlation_id.clone(),
        };
        if self
            .outbound
            .send(OutboundCommand {
                device_code: device_code.to_string(),
                message,
            })
            .is_err()
        {
            error!("outbound channel closed; play command for {device_code} dropped");
            return;
        }

        info!(
            "dispatching content {} ({}) to {device_code} [{}]",
            submission.content_id,
            submission.content_kind,
            submission.correlation_id
        );
        self.registry.update_current_content(
            device_code,
            Some((submission.content_id, submission.content_kind)),
        );
        if !submission.privileged {
            if self
                .quota
                .record_play(submission.submitter_id, submission.content_id, now)
            {
                debug!(
                    "quota charged: submitter={} content={}",
                    submission.submitter_id, submission.content_id
                );
            }
        }
    }
}
