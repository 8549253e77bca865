//! Registration Reconciliation Daemon
//!
//! Observes the live presence of WebRTC client endpoints on a local
//! Asterisk switch through its management channel and keeps a matching
//! set of outbound registrations to a remote Genesys SIP server
//! continuously synchronized with that observed presence.
//!
//! # Architecture
//!
//! ```text
//! +-----------------+      +---------------------------+      +-----------------+
//! |  Asterisk AMI   |      |         regsyncd          |      |  Genesys SIP    |
//! |                 |      |                           |      |                 |
//! |  ContactStatus  |----->|  AmiClient (channel)      |      |  outbound       |
//! |  PeerStatus     |      |       |                   |      |  registrations  |
//! |  DeviceState    |      |       v                   |      |                 |
//! |                 |      |  classify -> RegSync -----|----->|  REGISTER /     |
//! |                 |      |       ^        |          |      |  un-REGISTER    |
//! |                 |      |  Supervisor  ledger       |      |                 |
//! +-----------------+      +---------------------------+      +-----------------+
//! ```
//!
//! The supervisor reconnects the management channel on loss and forces a
//! full resync pass before resuming live event processing. The ledger -
//! the set of DNs believed registered remotely - is owned exclusively by
//! the reconciliation engine and published read-only to the status server.

pub mod channel;
pub mod classify;
pub mod config;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod reconcile;
pub mod status;
pub mod supervisor;
pub mod types;

pub use channel::{AmiAction, AmiClient, AmiEvent, AmiResponse};
pub use classify::{PresenceEvent, classify};
pub use config::RegsyncConfig;
pub use driver::{AmiRegistrationDriver, RegistrationDriver, RemotePeer, registration_name};
pub use error::{RegsyncError, Result};
pub use metrics::MetricsCollector;
pub use reconcile::{LedgerHandle, RegSync};
pub use status::{StatusState, spawn_status_server};
pub use supervisor::{ChannelState, Supervisor};
pub use types::{Dn, DnState, MonitorScope, PresenceSignal};
