//! # Transport Module - MQTT Protocol Handling
//!
//! Everything that touches the wire: the JSON message shapes exchanged with
//! devices, the topic naming scheme, the outbound writer task that publishes
//! play commands, and the inbound event pump that decodes heartbeats and
//! status reports.
//!
//! ## Topics
//!
//! - `device/{code}/cmd` — outbound play commands (QoS >= 1)
//! - `device/{code}/heartbeat` — inbound liveness + current-content self-report
//! - `device/{code}/status` — inbound command acknowledgments
//!
//! ## Robustness
//!
//! Malformed inbound payloads are logged (through [`crate::logutil::payload_preview`]
//! so binary junk cannot break log lines) and dropped; they are never fatal to
//! the listener. An empty heartbeat payload is treated as a bare ping.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::MqttConfig;
use crate::ledger::PushLedger;
use crate::logutil::payload_preview;
use crate::metrics;
use crate::queue::ContentKind;
use crate::validation::is_valid_device_code;

/// Play command published to a device (backend -> device).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandMessage {
    /// Content type: `IMAGE` or `VIDEO`.
    #[serde(rename = "type")]
    pub kind: ContentKind,
    pub content_id: i64,
    /// Download URL for the artifact.
    pub url: String,
    /// Artifact size in bytes.
    pub size: i64,
    /// Artifact checksum, when the upload subsystem supplied one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    /// Epoch milliseconds at publish time.
    pub timestamp: i64,
    /// Correlation id echoed back in status reports.
    pub message_id: String,
}

/// Heartbeat reported by a device (device -> backend). All fields optional:
/// an empty payload is a plain liveness ping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatMessage {
    pub device_code: Option<String>,
    /// Device status token, normally `ONLINE`.
    pub status: Option<String>,
    /// Content the device believes it is currently showing.
    pub current_content_id: Option<i64>,
    /// `IMAGE` or `VIDEO`; unknown tokens are logged and ignored.
    pub current_content_type: Option<String>,
    /// Battery percentage (0-100), when the hardware reports it.
    pub battery: Option<i32>,
    /// Wi-Fi signal strength in dBm.
    pub signal: Option<i32>,
    pub timestamp: Option<i64>,
}

/// Command acknowledgment reported by a device (device -> backend).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    /// `SUCCESS`, `FAILED`, `DOWNLOADING` or `DISPLAYING`.
    pub status: String,
    /// Correlation id of the command being acknowledged.
    #[serde(default)]
    pub message_id: Option<String>,
    /// Error detail, present on failures.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Parsed status token. Only `Success`/`Failed` are terminal; the rest are
/// informational progress updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Success,
    Failed,
    Downloading,
    Displaying,
}

impl ReportKind {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "SUCCESS" => Some(ReportKind::Success),
            "FAILED" => Some(ReportKind::Failed),
            "DOWNLOADING" => Some(ReportKind::Downloading),
            "DISPLAYING" => Some(ReportKind::Displaying),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ReportKind::Success | ReportKind::Failed)
    }
}

/// Inbound topic classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    Heartbeat,
    Status,
}

pub fn command_topic(device_code: &str) -> String {
    format!("device/{device_code}/cmd")
}

pub const HEARTBEAT_SUBSCRIPTION: &str = "device/+/heartbeat";
pub const STATUS_SUBSCRIPTION: &str = "device/+/status";

/// Split an inbound topic into device code and message kind. Returns `None`
/// for topics outside the `device/{code}/...` scheme or with an invalid code.
pub fn parse_inbound_topic(topic: &str) -> Option<(&str, InboundKind)> {
    let mut parts = topic.split('/');
    if parts.next()? != "device" {
        return None;
    }
    let code = parts.next()?;
    let kind = match parts.next()? {
        "heartbeat" => InboundKind::Heartbeat,
        "status" => InboundKind::Status,
        _ => return None,
    };
    if parts.next().is_some() || !is_valid_device_code(code) {
        return None;
    }
    Some((code, kind))
}

/// Decoded inbound device message, routed to the server's handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Heartbeat {
        device_code: String,
        message: HeartbeatMessage,
    },
    Status {
        device_code: String,
        message: StatusMessage,
    },
}

/// Decode one received publish into an [`InboundEvent`]. Malformed topics and
/// payloads yield `None` and a warning; they never propagate an error.
pub fn decode_publish(topic: &str, payload: &[u8]) -> Option<InboundEvent> {
    let Some((code, kind)) = parse_inbound_topic(topic) else {
        warn!("ignoring message on unrecognized topic: {topic}");
        return None;
    };
    match kind {
        InboundKind::Heartbeat => {
            let message = if payload.iter().all(|b| b.is_ascii_whitespace()) {
                // Bare ping: liveness only
                HeartbeatMessage::default()
            } else {
                match serde_json::from_slice(payload) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(
                            "dropping malformed heartbeat from {code}: {e} (payload: {})",
                            payload_preview(payload)
                        );
                        return None;
                    }
                }
            };
            Some(InboundEvent::Heartbeat {
                device_code: code.to_string(),
                message,
            })
        }
        InboundKind::Status => match serde_json::from_slice(payload) {
            Ok(message) => Some(InboundEvent::Status {
                device_code: code.to_string(),
                message,
            }),
            Err(e) => {
                warn!(
                    "dropping malformed status report from {code}: {e} (payload: {})",
                    payload_preview(payload)
                );
                None
            }
        },
    }
}

/// A play command waiting for the writer task, already addressed to a device.
#[derive(Debug, Clone)]
pub struct OutboundCommand {
    pub device_code: String,
    pub message: CommandMessage,
}

/// Map the configured QoS level to rumqttc's. Commands require at-least-once
/// delivery, so level 0 is bumped with a warning.
pub fn command_qos(level: u8) -> QoS {
    match level {
        0 => {
            warn!("mqtt.qos = 0 does not guarantee command delivery; using QoS 1");
            QoS::AtLeastOnce
        }
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Build the MQTT client and its event loop from configuration. The client is
/// owned by the server and handed by clone to the writer and pump tasks.
pub fn connect(config: &MqttConfig) -> (AsyncClient, EventLoop) {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username, password);
    }
    AsyncClient::new(options, 64)
}

/// Spawn the outbound writer: drains queued commands, publishes them, and
/// marks the matching ledger entry `Sent` on success. Publish failures are
/// logged and dropped; the scheduler re-dispatches naturally on a later tick
/// once the content is re-enqueued.
pub fn start_writer(
    client: AsyncClient,
    qos: QoS,
    mut rx: mpsc::UnboundedReceiver<OutboundCommand>,
    ledger: Arc<PushLedger>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            let topic = command_topic(&command.device_code);
            let payload = match serde_json::to_vec(&command.message) {
                Ok(payload) => payload,
                Err(e) => {
                    error!("failed to encode play command for {topic}: {e}");
                    continue;
                }
            };
            match client.publish(&topic, qos, false, payload).await {
                Ok(()) => {
                    metrics::inc_commands_published();
                    debug!(
                        "published play command: topic={topic} contentId={} messageId={}",
                        command.message.content_id, command.message.message_id
                    );
                    if let Err(e) = ledger.mark_sent(&command.message.message_id, chrono::Utc::now())
                    {
                        warn!(
                            "could not mark ledger entry {} as sent: {e}",
                            command.message.message_id
                        );
                    }
                }
                Err(e) => {
                    metrics::inc_publish_failures();
                    error!("mqtt publish failed: topic={topic}: {e}");
                }
            }
        }
        debug!("outbound writer terminated");
    })
}

/// Spawn the inbound pump: polls the MQTT event loop, re-subscribes to the
/// device topics on every (re)connect, and forwards decoded events to the
/// server. Connection errors are logged and retried with a short backoff.
pub fn start_event_pump(
    client: AsyncClient,
    mut eventloop: EventLoop,
    tx: mpsc::UnboundedSender<InboundEvent>,
    qos: QoS,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("mqtt connected; subscribing to device topics");
                    for topic in [HEARTBEAT_SUBSCRIPTION, STATUS_SUBSCRIPTION] {
                        if let Err(e) = client.subscribe(topic, qos).await {
                            error!("subscribe to {topic} failed: {e}");
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if let Some(event) = decode_publish(&publish.topic, &publish.payload) {
                        if tx.send(event).is_err() {
                            debug!("inbound channel closed; stopping event pump");
                            return;
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt connection error: {e}; retrying in 3s");
                    tokio::time::sleep(Duration::from_secs(3)).await;
                }
            }
        }
    })
}
