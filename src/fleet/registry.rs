//! In-memory device registry fed by heartbeats.
//!
//! A device exists here once its first heartbeat arrives; registration is
//! implicit. The registry is the admission authority for visitor submissions
//! (visitors may only target online devices) and the scheduler's source of
//! which devices to tick.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::info;

use crate::queue::ContentKind;

/// Last known state of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub device_code: String,
    pub online: bool,
    pub last_heartbeat: DateTime<Utc>,
    /// Content the device last reported showing, reconciled from heartbeats
    /// and successful command acknowledgments.
    pub current_content: Option<(i64, ContentKind)>,
    pub battery: Option<i32>,
    pub signal: Option<i32>,
}

/// Fleet-wide device table. Methods are `&self` and internally synchronized.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<String, DeviceRecord>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DeviceRecord>> {
        self.devices.lock().expect("device registry mutex poisoned")
    }

    /// Record a heartbeat: creates the device on first contact, refreshes the
    /// liveness timestamp, and absorbs whatever telemetry the payload carried.
    pub fn mark_heartbeat(
        &self,
        device_code: &str,
        battery: Option<i32>,
        signal: Option<i32>,
        now: DateTime<Utc>,
    ) {
        let mut devices = self.lock();
        let record = devices
            .entry(device_code.to_string())
            .or_insert_with(|| {
                info!("new device registered: {device_code}");
                DeviceRecord {
                    device_code: device_code.to_string(),
                    online: true,
                    last_heartbeat: now,
                    current_content: None,
                    battery: None,
                    signal: None,
                }
            });
        if !record.online {
            info!("device {device_code} is back online");
        }
        record.online = true;
        record.last_heartbeat = now;
        if battery.is_some() {
            record.battery = battery;
        }
        if signal.is_some() {
            record.signal = signal;
        }
    }

    /// Update the content a device is believed to be showing.
    pub fn update_current_content(&self, device_code: &str, content: Option<(i64, ContentKind)>) {
        let mut devices = self.lock();
        if let Some(record) = devices.get_mut(device_code) {
            record.current_content = content;
        }
    }

    pub fn get(&self, device_code: &str) -> Option<DeviceRecord> {
        self.lock().get(device_code).cloned()
    }

    pub fn is_online(&self, device_code: &str) -> bool {
        self.lock().get(device_code).is_some_and(|r| r.online)
    }

    /// Codes of all devices currently considered online.
    pub fn online_devices(&self) -> Vec<String> {
        self.lock()
            .values()
            .filter(|r| r.online)
            .map(|r| r.device_code.clone())
            .collect()
    }

    /// Mark devices offline whose last heartbeat is older than `silence`.
    /// Returns the codes that flipped on this sweep.
    pub fn sweep_offline(&self, silence: Duration, now: DateTime<Utc>) -> Vec<String> {
        let cutoff = now - chrono::Duration::from_std(silence).unwrap_or_default();
        let mut flipped = Vec::new();
        let mut devices = self.lock();
        for record in devices.values_mut() {
            if record.online && record.last_heartbeat < cutoff {
                record.online = false;
                flipped.push(record.device_code.clone());
            }
        }
        flipped
    }

    /// All known devices, for the status report.
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        let mut records: Vec<DeviceRecord> = self.lock().values().cloned().collect();
        records.sort_by(|a, b| a.device_code.cmp(&b.device_code));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_heartbeat_registers_device() {
        let registry = DeviceRegistry::new();
        let now = Utc::now();
        assert!(!registry.is_online("lobby-1"));

        registry.mark_heartbeat("lobby-1", Some(90), Some(-55), now);
        let record = registry.get("lobby-1").unwrap();
        assert!(record.online);
        assert_eq!(record.battery, Some(90));
        assert_eq!(record.signal, Some(-55));
        assert_eq!(registry.online_devices(), vec!["lobby-1".to_string()]);
    }

    #[test]
    fn bare_ping_keeps_previous_telemetry() {
        let registry = DeviceRegistry::new();
        let now = Utc::now();
        registry.mark_heartbeat("lobby-1", Some(90), Some(-55), now);
        registry.mark_heartbeat("lobby-1", None, None, now + chrono::Duration::seconds(30));

        let record = registry.get("lobby-1").unwrap();
        assert_eq!(record.battery, Some(90));
        assert_eq!(record.last_heartbeat, now + chrono::Duration::seconds(30));
    }

    #[test]
    fn sweep_marks_silent_devices_offline() {
        let registry = DeviceRegistry::new();
        let now = Utc::now();
        registry.mark_heartbeat("quiet", None, None, now);
        registry.mark_heartbeat("chatty", None, None, now + chrono::Duration::seconds(80));

        let later = now + chrono::Duration::seconds(100);
        let flipped = registry.sweep_offline(Duration::from_secs(90), later);
        assert_eq!(flipped, vec!["quiet".to_string()]);
        assert!(!registry.is_online("quiet"));
        assert!(registry.is_online("chatty"));

        // A later heartbeat brings it back
        registry.mark_heartbeat("quiet", None, None, later);
        assert!(registry.is_online("quiet"));
    }

    #[test]
    fn current_content_updates_only_known_devices() {
        let registry = DeviceRegistry::new();
        registry.update_current_content("ghost", Some((1, ContentKind::Image)));
        assert!(registry.get("ghost").is_none());

        registry.mark_heartbeat("lobby-1", None, None, Utc::now());
        registry.update_current_content("lobby-1", Some((42, ContentKind::Video)));
        assert_eq!(
            registry.get("lobby-1").unwrap().current_content,
            Some((42, ContentKind::Video))
        );
    }
}
