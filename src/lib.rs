//! # Inkfleet - Content Scheduler for E-Ink Billboard Fleets
//!
//! Inkfleet operates a fleet of e-ink display devices connected over MQTT. It accepts
//! requests to show a piece of content on a device, arbitrates between operator and
//! visitor submissions, and keeps exactly one active "now playing" command per device,
//! advancing to the next queued item when the current play window elapses or is
//! preempted.
//!
//! ## Features
//!
//! - **Per-Device Play Queues**: Score-ordered pending submissions with a single
//!   current-slot holder and optional play-window deadline per device.
//! - **Preemption Rules**: Operator content supersedes older operator directives;
//!   visitor content transiently interrupts a standing operator directive and never
//!   starves behind it.
//! - **MQTT Protocol**: JSON play commands on `device/{code}/cmd`, heartbeats and
//!   command acknowledgments inbound on `device/{code}/heartbeat` and
//!   `device/{code}/status`.
//! - **Push Ledger**: Durable sled-backed record of every issued command and its
//!   outcome, reconciled from device status reports by correlation id.
//! - **Visitor Quotas**: Idempotent per-day play counting with a configurable limit.
//! - **Async Design**: Built with Tokio; a timer-driven scheduler advances devices
//!   concurrently with submission calls and inbound message handling.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use inkfleet::config::Config;
//! use inkfleet::fleet::FleetServer;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let server = FleetServer::new(config)?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`fleet`] - Server wiring, submission gateway, scheduler, device registry
//! - [`queue`] - Play queue and current-slot stores
//! - [`transport`] - MQTT wire messages, topics, outbound writer, inbound decoding
//! - [`ledger`] - Push ledger persistence
//! - [`config`] - Configuration management
//! - [`validation`] - Device code validation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  Submission     │ ← admission, preemption decisions
//! │  Gateway        │
//! └─────────────────┘
//!          │
//! ┌─────────────────┐     ┌─────────────────┐
//! │  Queue / Slot   │ ←── │   Scheduler     │ (periodic advancement)
//! │  Stores         │     └─────────────────┘
//! └─────────────────┘
//!          │
//! ┌─────────────────┐     ┌─────────────────┐
//! │  MQTT Transport │ ──→ │  Push Ledger    │ (status reconciliation)
//! └─────────────────┘     └─────────────────┘
//! ```

pub mod config;
pub mod fleet;
pub mod ledger;
pub mod logutil;
pub mod metrics;
pub mod queue;
pub mod transport;
pub mod validation;
