//! # Play Queue Module - Queue and Current-Slot Stores
//!
//! Per-device ordered collections of pending submissions plus the single-slot
//! "now playing" holder with its optional deadline.
//!
//! ## Ordering
//!
//! Every submission is inserted with a priority score: the epoch-millisecond
//! timestamp at admission, plus [`OPERATOR_PRIORITY_OFFSET`] when the submitter
//! is privileged. Lower scores pop first, so visitor submissions are served FIFO
//! among themselves and operator submissions sort after all contemporaneous
//! visitor content. Operators instead gain preemption rights exercised by the
//! submission gateway, which lets their content jump the queue immediately.
//!
//! Scores are paired with a monotonically increasing sequence number so that two
//! submissions admitted in the same millisecond keep their arrival order.
//!
//! ## Atomicity
//!
//! The store methods that move an entry between the queue and the current slot
//! ([`PlayQueueStore::occupy_next`], [`PlayQueueStore::promote`],
//! [`PlayQueueStore::requeue_current_last`]) each hold the store lock for the
//! whole pop-and-assign step. A gateway call and a scheduler tick racing on the
//! same device therefore never lose a popped entry or double-fill a slot.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Offset added to the epoch-millisecond score of privileged submissions.
///
/// Large enough that every operator entry sorts after every visitor entry
/// admitted within the same era; also used as the "last priority" score when a
/// preempted operator directive is put back in the queue.
pub const OPERATOR_PRIORITY_OFFSET: i64 = 9_999_999_999;

/// Kind of displayable content. Serialized as `IMAGE` / `VIDEO` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentKind {
    Image,
    Video,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Image => "IMAGE",
            ContentKind::Video => "VIDEO",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IMAGE" => Ok(ContentKind::Image),
            "VIDEO" => Ok(ContentKind::Video),
            _ => Err(()),
        }
    }
}

/// A request to display one content item on one device.
///
/// Lives only in the queue/slot stores; the durable counterpart is the ledger
/// entry reachable through `correlation_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub content_id: i64,
    pub content_kind: ContentKind,
    pub submitter_id: i64,
    /// Derived from the submitter's role at enqueue time.
    pub privileged: bool,
    /// Links to the push ledger entry for this command.
    pub correlation_id: String,
}

/// Play-window durations applied when a submission enters the current slot.
#[derive(Debug, Clone, Copy)]
pub struct PlayWindows {
    /// Fixed window for visitor content.
    pub visitor: Duration,
    /// Window for operator content; `None` means unbounded (cleared only by
    /// preemption or idleness).
    pub operator: Option<Duration>,
}

impl PlayWindows {
    pub fn ttl_for(&self, privileged: bool) -> Option<Duration> {
        if privileged {
            self.operator
        } else {
            Some(self.visitor)
        }
    }
}

/// The single active "now playing" submission for a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentSlot {
    pub submission: Submission,
    /// Absolute expiry; `None` for an unbounded operator window.
    pub deadline: Option<DateTime<Utc>>,
}

impl CurrentSlot {
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.deadline, Some(deadline) if deadline <= now)
    }

    /// Remaining time until expiry. `None` when the slot is unbounded; zero when
    /// already past the deadline.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.deadline
            .map(|deadline| (deadline - now).to_std().unwrap_or(Duration::ZERO))
    }
}

/// Compute the priority score for a submission admitted at `now`.
pub fn priority_score(privileged: bool, now: DateTime<Utc>) -> i64 {
    let mut score = now.timestamp_millis();
    if privileged {
        score += OPERATOR_PRIORITY_OFFSET;
    }
    score
}

/// Total-order key for queue entries: score first, then arrival sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    score: i64,
    seq: u64,
}

#[derive(Debug, Default)]
struct DeviceQueue {
    entries: BTreeMap<QueueKey, Submission>,
    current: Option<CurrentSlot>,
}

#[derive(Debug, Default)]
struct Inner {
    devices: HashMap<String, DeviceQueue>,
    next_seq: u64,
}

/// In-memory queue + current-slot store for the whole fleet.
///
/// Shared between the submission gateway, the scheduler and the server; all
/// methods are `&self` and internally synchronized.
#[derive(Debug, Default)]
pub struct PlayQueueStore {
    inner: Mutex<Inner>,
}

impl PlayQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("play queue mutex poisoned")
    }

    /// Insert a submission with the given score. Returns the queue position
    /// (0-based) the entry landed at.
    pub fn insert(&self, device: &str, submission: Submission, score: i64) -> usize {
        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let queue = inner.devices.entry(device.to_string()).or_default();
        let key = QueueKey { score, seq };
        queue.entries.insert(key, submission);
        queue.entries.range(..key).count()
    }

    /// Current slot occupant, if any. An expired slot is still reported; it is
    /// purged on the next [`occupy_next`](Self::occupy_next) call.
    pub fn current(&self, device: &str) -> Option<CurrentSlot> {
        let inner = self.lock();
        inner.devices.get(device).and_then(|q| q.current.clone())
    }

    /// True when the device's slot is empty, past its deadline, or within
    /// `lookahead` of it. An unbounded slot never reports as expiring.
    pub fn slot_vacant_or_expiring(
        &self,
        device: &str,
        lookahead: Duration,
        now: DateTime<Utc>,
    ) -> bool {
        let inner = self.lock();
        let Some(slot) = inner.devices.get(device).and_then(|q| q.current.as_ref()) else {
            return true;
        };
        match slot.remaining(now) {
            None => false,
            Some(remaining) => remaining <= lookahead,
        }
    }

    /// Pop the lowest-score queue entry into the current slot, assigning the
    /// play window that matches the entry's privilege. An expired occupant is
    /// dropped first; if the queue is empty the slot is left vacant.
    ///
    /// The pop-and-assign step is atomic with respect to all other store calls.
    pub fn occupy_next(
        &self,
        device: &str,
        windows: &PlayWindows,
        now: DateTime<Utc>,
    ) -> Option<Submission> {
        let mut inner = self.lock();
        let queue = inner.devices.entry(device.to_string()).or_default();
        if queue.current.as_ref().is_some_and(|slot| slot.expired(now)) {
            queue.current = None;
        }
        let key = *queue.entries.keys().next()?;
        let submission = queue.entries.remove(&key)?;
        queue.current = Some(CurrentSlot {
            deadline: windows
                .ttl_for(submission.privileged)
                .map(|ttl| now + chrono::Duration::from_std(ttl).unwrap_or_default()),
            submission: submission.clone(),
        });
        Some(submission)
    }

    /// Move the queue entry with the given correlation id straight into the
    /// current slot, replacing any occupant. Used by the gateway's preemption
    /// paths, where the new submission (not the queue head) must play next.
    pub fn promote(
        &self,
        device: &str,
        correlation_id: &str,
        windows: &PlayWindows,
        now: DateTime<Utc>,
    ) -> Option<Submission> {
        let mut inner = self.lock();
        let queue = inner.devices.get_mut(device)?;
        let key = *queue
            .entries
            .iter()
            .find(|(_, s)| s.correlation_id == correlation_id)
            .map(|(k, _)| k)?;
        let submission = queue.entries.remove(&key)?;
        queue.current = Some(CurrentSlot {
            deadline: windows
                .ttl_for(submission.privileged)
                .map(|ttl| now + chrono::Duration::from_std(ttl).unwrap_or_default()),
            submission: submission.clone(),
        });
        Some(submission)
    }

    /// Clear the slot without requeuing the occupant. Returns the evicted
    /// submission, if any.
    pub fn clear_slot(&self, device: &str) -> Option<Submission> {
        let mut inner = self.lock();
        let queue = inner.devices.get_mut(device)?;
        queue.current.take().map(|slot| slot.submission)
    }

    /// Move the slot occupant back into the queue with the given score and
    /// clear the slot. Used when visitor content interrupts a standing operator
    /// directive: the directive resumes after all currently waiting items.
    pub fn requeue_current_last(&self, device: &str, score: i64) -> Option<Submission> {
        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let queue = inner.devices.get_mut(device)?;
        let slot = queue.current.take()?;
        queue
            .entries
            .insert(QueueKey { score, seq }, slot.submission.clone());
        Some(slot.submission)
    }

    /// Remove every privileged queue entry except the one with the given
    /// correlation id. A newer operator directive invalidates older pending
    /// ones. Returns the number of entries removed.
    pub fn remove_privileged_except(&self, device: &str, keep_correlation_id: &str) -> usize {
        let mut inner = self.lock();
        let Some(queue) = inner.devices.get_mut(device) else {
            return 0;
        };
        let stale: Vec<QueueKey> = queue
            .entries
            .iter()
            .filter(|(_, s)| s.privileged && s.correlation_id != keep_correlation_id)
            .map(|(k, _)| *k)
            .collect();
        for key in &stale {
            queue.entries.remove(key);
        }
        stale.len()
    }

    /// Remove queued entries by correlation id. Returns the number removed.
    pub fn remove_by_correlation(&self, device: &str, correlation_ids: &[String]) -> usize {
        let mut inner = self.lock();
        let Some(queue) = inner.devices.get_mut(device) else {
            return 0;
        };
        let victims: Vec<QueueKey> = queue
            .entries
            .iter()
            .filter(|(_, s)| correlation_ids.iter().any(|id| *id == s.correlation_id))
            .map(|(k, _)| *k)
            .collect();
        for key in &victims {
            queue.entries.remove(key);
        }
        victims.len()
    }

    /// Enumerate a device's pending entries in ascending score order.
    pub fn list(&self, device: &str) -> Vec<(i64, Submission)> {
        let inner = self.lock();
        inner
            .devices
            .get(device)
            .map(|q| {
                q.entries
                    .iter()
                    .map(|(k, s)| (k.score, s.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn queue_len(&self, device: &str) -> usize {
        let inner = self.lock();
        inner
            .devices
            .get(device)
            .map(|q| q.entries.len())
            .unwrap_or(0)
    }

    /// Delete every pending entry for a device. Returns the number removed.
    pub fn clear_queue(&self, device: &str) -> usize {
        let mut inner = self.lock();
        let Some(queue) = inner.devices.get_mut(device) else {
            return 0;
        };
        let removed = queue.entries.len();
        queue.entries.clear();
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission(content_id: i64, privileged: bool, correlation: &str) -> Submission {
        Submission {
            content_id,
            content_kind: ContentKind::Image,
            submitter_id: 7,
            privileged,
            correlation_id: correlation.to_string(),
        }
    }

    fn windows() -> PlayWindows {
        PlayWindows {
            visitor: Duration::from_secs(120),
            operator: None,
        }
    }

    #[test]
    fn pops_in_ascending_score_order() {
        let store = PlayQueueStore::new();
        let now = Utc::now();
        store.insert("d1", submission(2, false, "c2"), 200);
        store.insert("d1", submission(1, false, "c1"), 100);
        store.insert("d1", submission(3, false, "c3"), 300);

        let first = store.occupy_next("d1", &windows(), now).unwrap();
        assert_eq!(first.content_id, 1);
        // Slot occupied; pop again after clearing to see FIFO continue
        store.clear_slot("d1");
        let second = store.occupy_next("d1", &windows(), now).unwrap();
        assert_eq!(second.content_id, 2);
    }

    #[test]
    fn equal_scores_keep_arrival_order() {
        let store = PlayQueueStore::new();
        let now = Utc::now();
        store.insert("d1", submission(1, false, "c1"), 500);
        store.insert("d1", submission(2, false, "c2"), 500);
        assert_eq!(store.occupy_next("d1", &windows(), now).unwrap().content_id, 1);
    }

    #[test]
    fn occupy_assigns_visitor_deadline_and_unbounded_operator() {
        let store = PlayQueueStore::new();
        let now = Utc::now();
        store.insert("d1", submission(1, false, "c1"), 100);
        store.occupy_next("d1", &windows(), now).unwrap();
        let slot = store.current("d1").unwrap();
        assert!(slot.deadline.is_some());
        assert!(!slot.expired(now));

        store.clear_slot("d1");
        store.insert("d1", submission(2, true, "c2"), 100);
        store.occupy_next("d1", &windows(), now).unwrap();
        let slot = store.current("d1").unwrap();
        assert!(slot.deadline.is_none());
        assert!(slot.remaining(now).is_none());
    }

    #[test]
    fn expired_slot_is_purged_on_next_occupy() {
        let store = PlayQueueStore::new();
        let now = Utc::now();
        store.insert("d1", submission(1, false, "c1"), 100);
        store.occupy_next("d1", &windows(), now).unwrap();

        let later = now + chrono::Duration::seconds(121);
        assert!(store.slot_vacant_or_expiring("d1", Duration::from_secs(10), later));
        // Queue empty: expired occupant dropped, slot left vacant
        assert!(store.occupy_next("d1", &windows(), later).is_none());
        assert!(store.current("d1").is_none());
    }

    #[test]
    fn lookahead_counts_near_expiry_as_vacant() {
        let store = PlayQueueStore::new();
        let now = Utc::now();
        store.insert("d1", submission(1, false, "c1"), 100);
        store.occupy_next("d1", &windows(), now).unwrap();

        let near = now + chrono::Duration::seconds(115);
        assert!(store.slot_vacant_or_expiring("d1", Duration::from_secs(10), near));
        let mid = now + chrono::Duration::seconds(60);
        assert!(!store.slot_vacant_or_expiring("d1", Duration::from_secs(10), mid));
    }

    #[test]
    fn requeue_current_last_plays_after_waiting_items() {
        let store = PlayQueueStore::new();
        let now = Utc::now();
        store.insert("d1", submission(1, true, "op"), 100 + OPERATOR_PRIORITY_OFFSET);
        store.occupy_next("d1", &windows(), now).unwrap();
        store.insert("d1", submission(2, false, "v1"), 200);

        let requeued = store
            .requeue_current_last("d1", priority_score(true, now))
            .unwrap();
        assert_eq!(requeued.content_id, 1);
        assert!(store.current("d1").is_none());

        // Visitor entry pops first, operator resumes afterwards
        assert_eq!(store.occupy_next("d1", &windows(), now).unwrap().content_id, 2);
        store.clear_slot("d1");
        assert_eq!(store.occupy_next("d1", &windows(), now).unwrap().content_id, 1);
    }

    #[test]
    fn promote_takes_a_specific_entry() {
        let store = PlayQueueStore::new();
        let now = Utc::now();
        store.insert("d1", submission(1, false, "v1"), 100);
        store.insert("d1", submission(2, true, "op"), 100 + OPERATOR_PRIORITY_OFFSET);

        let promoted = store.promote("d1", "op", &windows(), now).unwrap();
        assert_eq!(promoted.content_id, 2);
        assert_eq!(store.current("d1").unwrap().submission.content_id, 2);
        // The visitor entry is untouched
        assert_eq!(store.queue_len("d1"), 1);
        assert!(store.promote("d1", "missing", &windows(), now).is_none());
    }

    #[test]
    fn remove_privileged_except_keeps_newest_directive() {
        let store = PlayQueueStore::new();
        store.insert("d1", submission(1, true, "old1"), 100 + OPERATOR_PRIORITY_OFFSET);
        store.insert("d1", submission(2, false, "v1"), 150);
        store.insert("d1", submission(3, true, "old2"), 200 + OPERATOR_PRIORITY_OFFSET);
        store.insert("d1", submission(4, true, "new"), 300 + OPERATOR_PRIORITY_OFFSET);

        assert_eq!(store.remove_privileged_except("d1", "new"), 2);
        let remaining: Vec<String> = store
            .list("d1")
            .into_iter()
            .map(|(_, s)| s.correlation_id)
            .collect();
        assert_eq!(remaining, vec!["v1".to_string(), "new".to_string()]);
    }

    #[test]
    fn remove_by_correlation_and_clear() {
        let store = PlayQueueStore::new();
        store.insert("d1", submission(1, false, "a"), 100);
        store.insert("d1", submission(2, false, "b"), 200);
        store.insert("d1", submission(3, false, "c"), 300);

        assert_eq!(
            store.remove_by_correlation("d1", &["a".to_string(), "c".to_string()]),
            2
        );
        assert_eq!(store.queue_len("d1"), 1);
        assert_eq!(store.clear_queue("d1"), 1);
        assert_eq!(store.queue_len("d1"), 0);
    }

    #[test]
    fn devices_are_isolated() {
        let store = PlayQueueStore::new();
        let now = Utc::now();
        store.insert("d1", submission(1, false, "c1"), 100);
        store.insert("d2", submission(2, false, "c2"), 100);

        store.occupy_next("d1", &windows(), now).unwrap();
        assert!(store.current("d2").is_none());
        assert_eq!(store.queue_len("d2"), 1);
    }

    #[test]
    fn operator_scores_sort_after_visitor_scores() {
        let now = Utc::now();
        assert!(priority_score(true, now) > priority_score(false, now));
        let much_later = now + chrono::Duration::days(30);
        assert!(priority_score(true, now) > priority_score(false, much_later));
    }

    #[test]
    fn content_kind_round_trips() {
        assert_eq!("IMAGE".parse::<ContentKind>(), Ok(ContentKind::Image));
        assert_eq!("VIDEO".parse::<ContentKind>(), Ok(ContentKind::Video));
        assert!("AUDIO".parse::<ContentKind>().is_err());
        assert_eq!(
            serde_json::to_string(&ContentKind::Video).unwrap(),
            "\"VIDEO\""
        );
    }

    #[test]
    fn submission_encoding_round_trips() {
        let s = submission(42, true, "abc123");
        let bytes = serde_json::to_vec(&s).unwrap();
        let back: Submission = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, s);
    }
}
