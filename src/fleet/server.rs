//! Fleet server: wiring and the inbound event loop.
//!
//! Owns the shared [`FleetCore`], connects the MQTT transport, spawns the
//! writer, event pump and scheduler tasks, and consumes decoded inbound
//! events until shutdown.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};

use crate::config::Config;
use crate::ledger::{PushLedger, PushStatus};
use crate::metrics;
use crate::queue::ContentKind;
use crate::transport::{self, InboundEvent, OutboundCommand, ReportKind};

use super::scheduler::{self, SchedulerTuning};
use super::{FleetCore, SubmissionGateway};

pub struct FleetServer {
    config: Config,
    core: Arc<FleetCore>,
    gateway: SubmissionGateway,
    outbound_rx: Option<mpsc::UnboundedReceiver<OutboundCommand>>,
}

impl FleetServer {
    /// Build the server: opens the ledger and assembles the shared core. No
    /// network activity happens until [`run`](Self::run).
    pub fn new(config: Config) -> Result<Self> {
        let ledger_path = Path::new(&config.storage.data_dir).join("ledger");
        let ledger = Arc::new(
            PushLedger::open(&ledger_path)
                .with_context(|| format!("opening push ledger at {}", ledger_path.display()))?,
        );
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let core = Arc::new(FleetCore::new(
            ledger,
            config.playback.windows(),
            config.playback.visitor_daily_limit,
            outbound_tx,
        ));
        let gateway = SubmissionGateway::new(core.clone());
        Ok(Self {
            config,
            core,
            gateway,
            outbound_rx: Some(outbound_rx),
        })
    }

    pub fn core(&self) -> &Arc<FleetCore> {
        &self.core
    }

    pub fn gateway(&self) -> &SubmissionGateway {
        &self.gateway
    }

    /// Connect to the broker and run until Ctrl-C.
    pub async fn run(mut self) -> Result<()> {
        info!(
            "starting fleet server '{}' (mqtt {}:{})",
            self.config.fleet.name, self.config.mqtt.host, self.config.mqtt.port
        );

        let outbound_rx = self
            .outbound_rx
            .take()
            .context("server already running")?;

        let (client, eventloop) = transport::connect(&self.config.mqtt);
        let qos = transport::command_qos(self.config.mqtt.qos);

        let writer = transport::start_writer(
            client.clone(),
            qos,
            outbound_rx,
            self.core.ledger.clone(),
        );
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let pump = transport::start_event_pump(client, eventloop, inbound_tx, qos);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tuning = SchedulerTuning {
            poll_interval: self.config.playback.poll_interval(),
            switch_ahead: self.config.playback.switch_ahead(),
            offline_after: self.config.playback.offline_after(),
        };
        let ticker = scheduler::start(self.core.clone(), tuning, shutdown_rx);

        loop {
            tokio::select! {
                event = inbound_rx.recv() => {
                    match event {
                        Some(event) => self.handle_inbound(event),
                        None => {
                            warn!("inbound channel closed; shutting down");
                            break;
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        let _ = shutdown_tx.send(true);
        ticker.abort();
        pump.abort();
        writer.abort();
        info!("fleet server stopped");
        Ok(())
    }

    /// Route one decoded device message.
    pub fn handle_inbound(&self, event: InboundEvent) {
        match event {
            InboundEvent::Heartbeat {
                device_code,
                message,
            } => {
                metrics::inc_heartbeats();
                let now = Utc::now();
                self.core
                    .registry
                    .mark_heartbeat(&device_code, message.battery, message.signal, now);

                // Devices self-report what they are showing; the registry's
                // view follows the device, not the other way around.
                if let (Some(content_id), Some(kind_token)) =
                    (message.current_content_id, message.current_content_type.as_deref())
                {
                    match kind_token.parse::<ContentKind>() {
                        Ok(kind) => self
                            .core
                            .registry
                            .update_current_content(&device_code, Some((content_id, kind))),
                        Err(()) => warn!(
                            "heartbeat from {device_code} carries unknown content type: {kind_token}"
                        ),
                    }
                }
                debug!("heartbeat from {device_code}");
            }
            InboundEvent::Status {
                device_code,
                message,
            } => {
                let Some(correlation_id) = message.message_id.as_deref() else {
                    warn!("status report from {device_code} has no messageId; dropped");
                    return;
                };
                let Some(kind) = ReportKind::parse(&message.status) else {
                    warn!(
                        "status report from {device_code} has unknown status token: {}",
                        message.status
                    );
                    return;
                };
                if !kind.is_terminal() {
                    debug!(
                        "progress report from {device_code}: {} [{correlation_id}]",
                        message.status
                    );
                    return;
                }

                let outcome = match kind {
                    ReportKind::Success => PushStatus::Success,
                    _ => PushStatus::Failed,
                };
                let now = Utc::now();
                match self
                    .core
                    .ledger
                    .apply_report(correlation_id, outcome, message.error.clone(), now)
                {
                    Ok(Some(entry)) => match outcome {
                        PushStatus::Success => {
                            metrics::inc_status_success();
                            self.core.registry.update_current_content(
                                &device_code,
                                Some((entry.content_id, entry.content_kind)),
                            );
                            info!(
                                "content {} confirmed on {device_code} [{correlation_id}]",
                                entry.content_id
                            );
                        }
                        _ => {
                            metrics::inc_status_failed();
                            warn!(
                                "content {} failed on {device_code} [{correlation_id}]: {}",
                                entry.content_id,
                                message.error.as_deref().unwrap_or("no detail")
                            );
                        }
                    },
                    Ok(None) => warn!(
                        "status report from {device_code} references unknown correlation {correlation_id}"
                    ),
                    Err(e) => warn!("ledger update failed for {correlation_id}: {e}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::gateway::{ContentRef, Submitter};
    use crate::ledger::Artifact;
    use crate::transport::{HeartbeatMessage, StatusMessage};

    fn server() -> (tempfile::TempDir, FleetServer) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config::default();
        config.storage.data_dir = dir.path().to_string_lossy().into_owned();
        let server = FleetServer::new(config).expect("server");
        (dir, server)
    }

    fn submit_playing(server: &FleetServer, device: &str, content_id: i64) -> String {
        server.core().registry.mark_heartbeat(device, None, None, Utc::now());
        let outcome = server
            .gateway()
            .submit(
                device,
                ContentRef {
                    content_id,
                    kind: ContentKind::Image,
                    artifact: Artifact {
                        url: format!("https://media.example/{content_id}.bin"),
                        size: 64,
                        md5: None,
                    },
                },
                Submitter {
                    id: 7,
                    privileged: false,
                },
                Utc::now(),
            )
            .expect("submit");
        outcome.correlation_id().to_string()
    }

    #[test]
    fn heartbeat_registers_and_reconciles_content() {
        let (_dir, server) = server();
        server.handle_inbound(InboundEvent::Heartbeat {
            device_code: "lobby-1".into(),
            message: HeartbeatMessage {
                battery: Some(77),
                current_content_id: Some(9),
                current_content_type: Some("VIDEO".into()),
                ..HeartbeatMessage::default()
            },
        });

        let record = server.core().registry.get("lobby-1").unwrap();
        assert!(record.online);
        assert_eq!(record.battery, Some(77));
        assert_eq!(record.current_content, Some((9, ContentKind::Video)));
    }

    #[test]
    fn terminal_status_reports_settle_the_ledger() {
        let (_dir, server) = server();
        let correlation = submit_playing(&server, "lobby-1", 42);
        let entry = server.core().ledger.get(&correlation).unwrap().unwrap();
        assert_eq!(entry.status, PushStatus::Pending);

        server.handle_inbound(InboundEvent::Status {
            device_code: "lobby-1".into(),
            message: StatusMessage {
                status: "SUCCESS".into(),
                message_id: Some(correlation.clone()),
                error: None,
                timestamp: None,
            },
        });
        let entry = server.core().ledger.get(&correlation).unwrap().unwrap();
        assert_eq!(entry.status, PushStatus::Success);
    }

    #[test]
    fn failure_report_records_the_error() {
        let (_dir, server) = server();
        let correlation = submit_playing(&server, "lobby-1", 42);

        server.handle_inbound(InboundEvent::Status {
            device_code: "lobby-1".into(),
            message: StatusMessage {
                status: "FAILED".into(),
                message_id: Some(correlation.clone()),
                error: Some("download timeout".into()),
                timestamp: None,
            },
        });
        let entry = server.core().ledger.get(&correlation).unwrap().unwrap();
        assert_eq!(entry.status, PushStatus::Failed);
        assert_eq!(entry.error.as_deref(), Some("download timeout"));
    }

    #[test]
    fn malformed_status_reports_are_dropped() {
        let (_dir, server) = server();
        let correlation = submit_playing(&server, "lobby-1", 42);

        // No messageId
        server.handle_inbound(InboundEvent::Status {
            device_code: "lobby-1".into(),
            message: StatusMessage {
                status: "SUCCESS".into(),
                message_id: None,
                error: None,
                timestamp: None,
            },
        });
        // Unknown token
        server.handle_inbound(InboundEvent::Status {
            device_code: "lobby-1".into(),
            message: StatusMessage {
                status: "REBOOTING".into(),
                message_id: Some(correlation.clone()),
                error: None,
                timestamp: None,
            },
        });
        // Progress reports do not settle anything
        server.handle_inbound(InboundEvent::Status {
            device_code: "lobby-1".into(),
            message: StatusMessage {
                status: "DOWNLOADING".into(),
                message_id: Some(correlation.clone()),
                error: None,
                timestamp: None,
            },
        });
        let entry = server.core().ledger.get(&correlation).unwrap().unwrap();
        assert_eq!(entry.status, PushStatus::Pending);
    }
}
