//! LANPresence Core Library
//!
//! This crate provides the core functionality for LANPresence agents:
//! - Network sweep (bounded-concurrency ping sweep, ARP resolution,
//!   OUI-based device classification)
//! - Session tracking (device/network registry, session reconciler,
//!   missed-heartbeat bookkeeping)
//! - Presence notifications (subscription fan-out behind a pluggable
//!   notifier)
//! - Collector upload (push presence reports to a remote collector)
//!
//! # Example
//!
//! ```no_run
//! use lanpresence_core::scanner::{self, ProbeMethod, SweepOptions};
//! use lanpresence_core::tracker::{Medium, Tracker};
//! use lanpresence_core::notify::{self, TracingNotifier};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut tracker = Tracker::new();
//!     tracker.register_network("Home", "home wifi", Medium::Wifi)?;
//!
//!     // One sweep cycle, reconciled in-process.
//!     let reports = scanner::run_cycle(
//!         "Home",
//!         "wlan0",
//!         ProbeMethod::Icmp,
//!         &SweepOptions::default(),
//!     )
//!     .await?;
//!     let changes = tracker.ingest(&reports, chrono::Utc::now())?;
//!     notify::dispatch(&TracingNotifier, &tracker, "Home", &changes).await;
//!
//!     Ok(())
//! }
//! ```

pub mod collector;
pub mod config;
pub mod notify;
pub mod scanner;
pub mod tracker;

// Re-export commonly used types
pub use collector::CollectorClient;
pub use config::{AgentConfig, ConfigSource};
pub use notify::{Notifier, TracingNotifier};
pub use scanner::{InterfaceInfo, PresenceReport, ProbeMethod, Prober, Resolver, SweepOptions};
pub use tracker::{
    ActiveDevice, Device, DeviceClass, Medium, Network, PresenceChange, ProbePreference,
    RegisteredNetwork, Session, SessionStatus, Tracker, TrackerError,
};
