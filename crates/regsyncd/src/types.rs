//! Core types for registration reconciliation
//!
//! Defines the directory-number identifier, the normalized presence signal
//! derived from AMI events, and the monitored DN scope.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Directory number - identifier for a monitored client line.
///
/// Immutable once observed. DNs are short numeric strings in practice
/// ("5001"), but the type carries them verbatim so alphanumeric lines
/// configured through an explicit allow-list work too.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Dn(String);

impl Dn {
    /// Create a DN from any string-like value.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Borrow the DN as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric value, if the DN is a plain number.
    pub fn as_number(&self) -> Option<u32> {
        self.0.parse().ok()
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Dn {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Normalized presence signal for a DN.
///
/// Raw AMI events carry per-family status vocabularies; the classifier maps
/// each onto this three-valued signal. `Unknown` never triggers a
/// reconciliation transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceSignal {
    /// Client endpoint is registered/reachable on the local switch.
    Reachable,
    /// Client endpoint is unregistered/unreachable.
    Unreachable,
    /// Status does not reliably indicate registration state.
    Unknown,
}

impl PresenceSignal {
    /// Signal name for structured logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceSignal::Reachable => "reachable",
            PresenceSignal::Unreachable => "unreachable",
            PresenceSignal::Unknown => "unknown",
        }
    }
}

/// Per-DN reconciliation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DnState {
    /// No outbound registration exists or is being created.
    #[default]
    Unregistered,
    /// A register action is in flight.
    Registering,
    /// An outbound registration is believed active on the remote peer.
    Registered,
    /// An unregister action is in flight.
    Unregistering,
}

impl DnState {
    /// State name for structured logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            DnState::Unregistered => "unregistered",
            DnState::Registering => "registering",
            DnState::Registered => "registered",
            DnState::Unregistering => "unregistering",
        }
    }
}

/// The set of DNs this daemon is responsible for.
///
/// Configured once at startup as either an inclusive numeric range or an
/// explicit allow-list; immutable for the process lifetime. The filter runs
/// before any side effect, so events for out-of-scope DNs never reach the
/// state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorScope {
    /// Inclusive numeric DN range, e.g. 5001-5020.
    Range { start: u32, end: u32 },
    /// Explicit allow-list of DNs.
    List(BTreeSet<Dn>),
}

impl MonitorScope {
    /// Check whether a DN falls inside the monitored scope.
    pub fn contains(&self, dn: &Dn) -> bool {
        match self {
            MonitorScope::Range { start, end } => match dn.as_number() {
                Some(n) => (*start..=*end).contains(&n),
                None => false,
            },
            MonitorScope::List(list) => list.contains(dn),
        }
    }

    /// All configured DNs, in ascending order.
    ///
    /// Used by the forced resync pass, which sweeps every configured DN
    /// regardless of what the ledger believes.
    pub fn dns(&self) -> Vec<Dn> {
        match self {
            MonitorScope::Range { start, end } => {
                (*start..=*end).map(|n| Dn::new(n.to_string())).collect()
            }
            MonitorScope::List(list) => list.iter().cloned().collect(),
        }
    }

    /// Number of configured DNs.
    pub fn len(&self) -> usize {
        match self {
            MonitorScope::Range { start, end } => {
                if end < start {
                    0
                } else {
                    (end - start + 1) as usize
                }
            }
            MonitorScope::List(list) => list.len(),
        }
    }

    /// True if no DN is monitored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for MonitorScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorScope::Range { start, end } => write!(f, "{}-{}", start, end),
            MonitorScope::List(list) => {
                let names: Vec<&str> = list.iter().map(|d| d.as_str()).collect();
                f.write_str(&names.join(","))
            }
        }
    }
}
