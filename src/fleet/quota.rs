//! Daily play quota for visitor submitters.
//!
//! Counts distinct content items a visitor has actually had dispatched per UTC
//! day. Counting by distinct content makes dispatch idempotent: replaying the
//! same content (after a TTL expiry or scheduler retry) consumes no additional
//! quota. Counters reset implicitly at the UTC day boundary. Operators are
//! never charged; the gateway simply skips the check for privileged
//! submitters.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, Utc};

#[derive(Debug, Default)]
struct DayPlays {
    day: Option<NaiveDate>,
    contents: HashSet<i64>,
}

/// Per-visitor daily dispatch counter.
#[derive(Debug)]
pub struct VisitorQuota {
    daily_limit: u32,
    plays: Mutex<HashMap<i64, DayPlays>>,
}

impl VisitorQuota {
    pub fn new(daily_limit: u32) -> Self {
        Self {
            daily_limit,
            plays: Mutex::new(HashMap::new()),
        }
    }

    pub fn daily_limit(&self) -> u32 {
        self.daily_limit
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, DayPlays>> {
        self.plays.lock().expect("visitor quota mutex poisoned")
    }

    /// Distinct content plays recorded for this submitter today.
    pub fn today_count(&self, submitter_id: i64, now: DateTime<Utc>) -> u32 {
        let plays = self.lock();
        match plays.get(&submitter_id) {
            Some(record) if record.day == Some(now.date_naive()) => record.contents.len() as u32,
            _ => 0,
        }
    }

    /// True when the submitter still has quota left for today.
    pub fn check(&self, submitter_id: i64, now: DateTime<Utc>) -> bool {
        self.today_count(submitter_id, now) < self.daily_limit
    }

    /// Charge one play. Returns `false` when this content was already counted
    /// today, so repeated dispatches of the same item are free.
    pub fn record_play(&self, submitter_id: i64, content_id: i64, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        let mut plays = self.lock();
        let record = plays.entry(submitter_id).or_default();
        if record.day != Some(today) {
            record.day = Some(today);
            record.contents.clear();
        }
        record.contents.insert(content_id)
    }
}
