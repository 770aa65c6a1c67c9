//! Submission admission and preemption.
//!
//! The gateway is the single entry point for "show this content on that
//! device" requests. It validates the target, enforces the visitor quota,
//! records the submission durably, and applies the preemption matrix:
//!
//! | current \ incoming | visitor                      | operator                    |
//! |--------------------|------------------------------|-----------------------------|
//! | empty slot         | plays now                    | plays now                   |
//! | visitor playing    | waits in FIFO order          | waits until the slot turns  |
//! | operator playing   | interrupts; operator requeued last | replaces; old directive discarded |
//!
//! A new operator directive additionally invalidates any older operator
//! entries still waiting in the queue, so at most one operator directive is
//! pending per device.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};
use thiserror::Error;
use uuid::Uuid;

use crate::ledger::{Artifact, LedgerError};
use crate::metrics;
use crate::queue::{priority_score, ContentKind, Submission};
use crate::validation::is_valid_device_code;

use super::FleetCore;

/// Content to display, as resolved by the caller (content id plus the
/// downloadable artifact produced at upload time).
#[derive(Debug, Clone)]
pub struct ContentRef {
    pub content_id: i64,
    pub kind: ContentKind,
    pub artifact: Artifact,
}

/// Who is asking. `privileged` is derived from the submitter's role.
#[derive(Debug, Clone, Copy)]
pub struct Submitter {
    pub id: i64,
    pub privileged: bool,
}

/// What happened to an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Waiting in the queue at the given 0-based position.
    Enqueued { correlation_id: String, position: usize },
    /// Took the current slot immediately; the play command is on its way.
    PlayingNow { correlation_id: String },
}

impl SubmitOutcome {
    pub fn correlation_id(&self) -> &str {
        match self {
            SubmitOutcome::Enqueued { correlation_id, .. } => correlation_id,
            SubmitOutcome::PlayingNow { correlation_id } => correlation_id,
        }
    }
}

/// Rejections surfaced to the caller. Everything here is an admission
/// failure; once a submission is admitted it cannot fail synchronously.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid device code")]
    InvalidDeviceCode,

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("device {0} is offline")]
    DeviceOffline(String),

    #[error("daily play limit reached ({used}/{limit})")]
    QuotaExhausted { used: u32, limit: u32 },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Admission front-end over the shared [`FleetCore`].
#[derive(Clone)]
pub struct SubmissionGateway {
    core: Arc<FleetCore>,
}

impl SubmissionGateway {
    pub fn new(core: Arc<FleetCore>) -> Self {
        Self { core }
    }

    /// Admit one submission and place it per the preemption matrix.
    pub fn submit(
        &self,
        device_code: &str,
        content: ContentRef,
        submitter: Submitter,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome, SubmitError> {
        if !is_valid_device_code(device_code) {
            return Err(SubmitError::InvalidDeviceCode);
        }

        // Every submission must target a device the fleet has seen at least
        // once. Visitors additionally need the device online right now;
        // operators may stage content for an offline device, and it plays
        // once the device returns and the scheduler ticks.
        match self.core.registry.get(device_code) {
            None => return Err(SubmitError::UnknownDevice(device_code.to_string())),
            Some(record) if !record.online && !submitter.privileged => {
                return Err(SubmitError::DeviceOffline(device_code.to_string()))
            }
            Some(_) => {}
        }
        if !submitter.privileged {
            if !self.core.quota.check(submitter.id, now) {
                return Err(SubmitError::QuotaExhausted {
                    used: self.core.quota.today_count(submitter.id, now),
                    limit: self.core.quota.daily_limit(),
                });
            }
        }

        let correlation_id = Uuid::new_v4().simple().to_string();
        self.core.ledger.admit(
            &correlation_id,
            device_code,
            content.content_id,
            content.kind,
            submitter.id,
            submitter.privileged,
            content.artifact,
            now,
        )?;

        let submission = Submission {
            content_id: content.content_id,
            content_kind: content.kind,
            submitter_id: submitter.id,
            privileged: submitter.privileged,
            correlation_id: correlation_id.clone(),
        };
        let score = priority_score(submitter.privileged, now);
        let position = self.core.store.insert(device_code, submission, score);
        metrics::inc_submissions_enqueued();

        let outcome = match self.core.store.current(device_code) {
            None => {
                // Empty slot: the head of the queue plays, which is this
                // submission unless earlier entries were already waiting.
                match self.core.advance_device(device_code, now) {
                    Some(playing) if playing.correlation_id == correlation_id => {
                        SubmitOutcome::PlayingNow { correlation_id }
                    }
                    _ => SubmitOutcome::Enqueued {
                        correlation_id,
                        position,
                    },
                }
            }
            Some(slot) if slot.submission.privileged && submitter.privileged => {
                // Newer directive wins; the interrupted one is discarded, and
                // older pending directives are invalidated.
                let evicted = self.core.store.clear_slot(device_code);
                if let Some(old) = evicted {
                    info!(
                        "operator directive {} superseded on {device_code}",
                        old.correlation_id
                    );
                }
                self.core
                    .store
                    .remove_privileged_except(device_code, &correlation_id);
                metrics::inc_preemptions();
                self.promote_and_dispatch(device_code, &correlation_id, now)
            }
            Some(slot) if slot.submission.privileged && !submitter.privileged => {
                // Visitor interrupts a standing directive; the directive goes
                // back in the queue after everything currently waiting.
                self.core
                    .store
                    .requeue_current_last(device_code, priority_score(true, now));
                metrics::inc_preemptions();
                self.promote_and_dispatch(device_code, &correlation_id, now)
            }
            Some(_) if submitter.privileged => {
                // Visitor content is never interrupted; the directive waits,
                // but it still invalidates older pending directives.
                self.core
                    .store
                    .remove_privileged_except(device_code, &correlation_id);
                SubmitOutcome::Enqueued {
                    correlation_id,
                    position,
                }
            }
            Some(_) => SubmitOutcome::Enqueued {
                correlation_id,
                position,
            },
        };
        Ok(outcome)
    }

    fn promote_and_dispatch(
        &self,
        device_code: &str,
        correlation_id: &str,
        now: DateTime<Utc>,
    ) -> SubmitOutcome {
        match self
            .core
            .store
            .promote(device_code, correlation_id, &self.core.windows, now)
        {
            Some(submission) => {
                self.core.dispatch(device_code, &submission, now);
                SubmitOutcome::PlayingNow {
                    correlation_id: correlation_id.to_string(),
                }
            }
            None => {
                // Lost a race with a concurrent scheduler tick that already
                // popped the entry; it is playing or about to.
                warn!("promotion raced for {correlation_id} on {device_code}");
                SubmitOutcome::PlayingNow {
                    correlation_id: correlation_id.to_string(),
                }
            }
        }
    }

    /// Pending entries for a device, ascending by priority score.
    pub fn queue(&self, device_code: &str) -> Vec<(i64, Submission)> {
        self.core.store.list(device_code)
    }

    /// Delete specific pending entries. Returns the number removed.
    pub fn remove_queued(&self, device_code: &str, correlation_ids: &[String]) -> usize {
        let removed = self.core.store.remove_by_correlation(device_code, correlation_ids);
        if removed > 0 {
            info!("removed {removed} queued entries from {device_code}");
        }
        removed
    }

    /// Drop every pending entry for a device. The current slot is untouched.
    pub fn clear_queue(&self, device_code: &str) -> usize {
        let removed = self.core.store.clear_queue(device_code);
        if removed > 0 {
            info!("cleared {removed} queued entries from {device_code}");
        }
        removed
    }
}
