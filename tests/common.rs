//! Shared harness for integration tests: a fleet core wired to a temp-dir
//! ledger and an in-process outbound channel standing in for the MQTT writer.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;

use inkfleet::fleet::{ContentRef, FleetCore, SubmissionGateway, Submitter};
use inkfleet::ledger::{Artifact, PushLedger};
use inkfleet::queue::{ContentKind, PlayWindows};
use inkfleet::transport::OutboundCommand;

pub const VISITOR: Submitter = Submitter {
    id: 7,
    privileged: false,
};
pub const OPERATOR: Submitter = Submitter {
    id: 1,
    privileged: true,
};

pub struct Harness {
    pub core: Arc<FleetCore>,
    pub gateway: SubmissionGateway,
    pub outbound: mpsc::UnboundedReceiver<OutboundCommand>,
    _dir: tempfile::TempDir,
}

impl Harness {
    /// Emulate the MQTT writer for one queued command: take it off the
    /// channel and mark its ledger entry `Sent`.
    pub fn deliver_next(&mut self) -> OutboundCommand {
        let command = self.outbound.try_recv().expect("a play command was queued");
        self.core
            .ledger
            .mark_sent(&command.message.message_id, Utc::now())
            .expect("mark sent");
        command
    }

    pub fn no_pending_commands(&mut self) -> bool {
        self.outbound.try_recv().is_err()
    }
}

pub fn harness(visitor_secs: u64, operator_secs: Option<u64>, daily_limit: u32) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let ledger = Arc::new(PushLedger::open(dir.path().join("ledger")).expect("open ledger"));
    let (tx, rx) = mpsc::unbounded_channel();
    let windows = PlayWindows {
        visitor: Duration::from_secs(visitor_secs),
        operator: operator_secs.map(Duration::from_secs),
    };
    let core = Arc::new(FleetCore::new(ledger, windows, daily_limit, tx));
    let gateway = SubmissionGateway::new(core.clone());
    Harness {
        core,
        gateway,
        outbound: rx,
        _dir: dir,
    }
}

pub fn image(content_id: i64) -> ContentRef {
    ContentRef {
        content_id,
        kind: ContentKind::Image,
        artifact: Artifact {
            url: format!("https://media.example/content/{content_id}.png"),
            size: 4096,
            md5: Some(format!("{content_id:032x}")),
        },
    }
}

pub fn video(content_id: i64) -> ContentRef {
    ContentRef {
        content_id,
        kind: ContentKind::Video,
        artifact: Artifact {
            url: format!("https://media.example/content/{content_id}.mjpeg"),
            size: 1 << 20,
            md5: None,
        },
    }
}
