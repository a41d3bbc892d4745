//! # FrameLock Net
//!
//! The distributed-systems engine of FrameLock: UDP broadcast discovery,
//! master election, PTP message plumbing, frame lockstep propagation,
//! settings replication and latency telemetry, wrapped in a single facade.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        SyncService                            │
//! │  ┌───────────┐   bounded    ┌──────────────────────────────┐  │
//! │  │ Transport │── channel ──▶│           Engine             │  │
//! │  │ (sockets, │              │ peers · election · ptp · pll │  │
//! │  │  rx task) │◀── sends ────│ frame · settings · telemetry │  │
//! │  └───────────┘              └──────────────────────────────┘  │
//! │        ▲                            │ atomic snapshots        │
//! │        │ UDP broadcast/unicast      ▼                         │
//! │      (LAN)                   embedder reads                   │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The receiver task owns nothing but its socket and the queue handle; the
//! engine thread owns every piece of mutable protocol state. Cross-thread
//! reads (synced time, frame number) go through atomic snapshots.

pub mod election;
pub mod engine;
pub mod env;
pub mod error;
pub mod peers;
pub mod service;
pub mod settings;
pub mod telemetry;
pub mod transport;

pub use election::{Election, MasterState, Role};
pub use engine::{Clock, Engine, EngineConfig, EngineEvent, Outbound};
pub use env::EnvironmentProbe;
pub use error::{NetError, Result};
pub use peers::{PeerRecord, PeerRegistry};
pub use service::{ServiceConfig, SyncService};
pub use settings::SettingsReplicator;
pub use telemetry::{MeasurementConfig, NetworkEvent, Telemetry};
pub use transport::Transport;

/// Default unicast port.
pub const DEFAULT_PORT: u16 = 7000;

/// Default broadcast port.
pub const BROADCAST_PORT: u16 = 7001;

/// Peers silent for longer than this are evicted.
pub const PEER_TIMEOUT_SECS: f64 = 10.0;

/// A leader silent for longer than this triggers an election.
pub const MASTER_TIMEOUT_SECS: f64 = 5.0;

/// Vote collection window after an election starts.
pub const ELECTION_TIMEOUT_SECS: f64 = 3.0;

/// Leader heartbeat interval.
pub const MASTER_ANNOUNCE_INTERVAL_SECS: f64 = 2.0;

/// Leader settings re-broadcast interval.
pub const SETTINGS_BROADCAST_INTERVAL_SECS: f64 = 5.0;

/// Probe timeout after which a ping counts as lost.
pub const PING_TIMEOUT_SECS: f64 = 2.0;
