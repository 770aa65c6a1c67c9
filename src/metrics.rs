//! Process-wide scheduling and transport counters.
use std::sync::atomic::{AtomicU64, Ordering};

static COMMANDS_PUBLISHED: AtomicU64 = AtomicU64::new(0);
static PUBLISH_FAILURES: AtomicU64 = AtomicU64::new(0);
static HEARTBEATS: AtomicU64 = AtomicU64::new(0);
static STATUS_SUCCESS: AtomicU64 = AtomicU64::new(0);
static STATUS_FAILED: AtomicU64 = AtomicU64::new(0);
static PREEMPTIONS: AtomicU64 = AtomicU64::new(0);
static SUBMISSIONS_ENQUEUED: AtomicU64 = AtomicU64::new(0);

pub fn inc_commands_published() {
    COMMANDS_PUBLISHED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_publish_failures() {
    PUBLISH_FAILURES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_heartbeats() {
    HEARTBEATS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_status_success() {
    STATUS_SUCCESS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_status_failed() {
    STATUS_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_preemptions() {
    PREEMPTIONS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_submissions_enqueued() {
    SUBMISSIONS_ENQUEUED.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    pub commands_published: u64,
    pub publish_failures: u64,
    pub heartbeats: u64,
    pub status_success: u64,
    pub status_failed: u64,
    pub preemptions: u64,
    pub submissions_enqueued: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        commands_published: COMMANDS_PUBLISHED.load(Ordering::Relaxed),
        publish_failures: PUBLISH_FAILURES.load(Ordering::Relaxed),
        heartbeats: HEARTBEATS.load(Ordering::Relaxed),
        status_success: STATUS_SUCCESS.load(Ordering::Relaxed),
        status_failed: STATUS_FAILED.load(Ordering::Relaxed),
        preemptions: PREEMPTIONS.load(Ordering::Relaxed),
        submissions_enqueued: SUBMISSIONS_ENQUEUED.load(Ordering::Relaxed),
    }
}
