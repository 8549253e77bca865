//! Presence classification for AMI events
//!
//! Maps the three raw event families the local switch emits onto a single
//! normalized presence signal per DN. Classification is pure: no side
//! effects, and the monitored-scope filter runs before anything else can
//! act on an event.
//!
//! Status vocabularies come from the switch and are mapped exhaustively;
//! anything outside the tables resolves to `Unknown`, which never triggers
//! a transition. In particular a device merely going idle (`NOT_INUSE`)
//! does not prove the endpoint is registered, so it maps to `Unknown`
//! rather than flapping the remote registration.

use crate::channel::AmiEvent;
use crate::types::{Dn, MonitorScope, PresenceSignal};
use once_cell::sync::Lazy;
use regex::Regex;

/// Composite peer/device keys look like "PJSIP/5001"; the DN is the digit
/// run after the transport prefix.
static PEER_DN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^PJSIP/(\d+)$").expect("valid peer pattern"));

/// The closed set of event families carrying presence information.
///
/// Decided once at ingestion; everything downstream matches on this enum
/// instead of comparing event-name strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    /// PJSIP contact binding status (keyed by an AOR-like composite).
    ContactStatus {
        /// AOR composite, e.g. "5001/sip:5001@10.8.0.5:8901".
        aor: String,
        /// Contact status string, e.g. "Reachable".
        status: String,
    },
    /// Peer registration status (keyed by "PJSIP/<dn>").
    PeerStatus {
        /// Peer composite, e.g. "PJSIP/5001".
        peer: String,
        /// Peer status string, e.g. "Registered".
        status: String,
    },
    /// Device state change (same composite key as peer status).
    DeviceState {
        /// Device composite, e.g. "PJSIP/5001".
        device: String,
        /// Device state string, e.g. "NOT_INUSE".
        state: String,
    },
}

impl PresenceEvent {
    /// Convert a raw AMI event into a presence event.
    ///
    /// Returns `None` for event kinds that carry no presence information;
    /// those are dropped at ingestion. Missing fields yield empty strings,
    /// which classify to `None` downstream.
    pub fn from_ami(event: &AmiEvent) -> Option<Self> {
        match event.name.as_str() {
            "ContactStatusDetail" => Some(PresenceEvent::ContactStatus {
                aor: event.get("AOR").unwrap_or_default().to_string(),
                status: event.get("Status").unwrap_or_default().to_string(),
            }),
            "PeerStatus" => Some(PresenceEvent::PeerStatus {
                peer: event.get("Peer").unwrap_or_default().to_string(),
                status: event.get("PeerStatus").unwrap_or_default().to_string(),
            }),
            "DeviceStateChange" => Some(PresenceEvent::DeviceState {
                device: event.get("Device").unwrap_or_default().to_string(),
                state: event.get("State").unwrap_or_default().to_string(),
            }),
            _ => None,
        }
    }
}

/// Classify a presence event into a `(dn, signal)` pair.
///
/// Returns `None` when the DN cannot be extracted or falls outside the
/// monitored scope. This filter is the invariant gate: out-of-scope DNs
/// never produce a register/unregister action.
pub fn classify(event: &PresenceEvent, scope: &MonitorScope) -> Option<(Dn, PresenceSignal)> {
    let (dn, signal) = match event {
        PresenceEvent::ContactStatus { aor, status } => {
            let dn = Dn::new(aor.split('/').next().unwrap_or(""));
            (dn, contact_status_signal(status))
        }
        PresenceEvent::PeerStatus { peer, status } => {
            let dn = peer_dn(peer)?;
            (dn, peer_status_signal(status))
        }
        PresenceEvent::DeviceState { device, state } => {
            let dn = peer_dn(device)?;
            (dn, device_state_signal(state))
        }
    };

    if dn.as_str().is_empty() || !scope.contains(&dn) {
        return None;
    }
    Some((dn, signal))
}

/// Extract the DN from a "PJSIP/<digits>" composite key.
fn peer_dn(composite: &str) -> Option<Dn> {
    PEER_DN_RE
        .captures(composite)
        .map(|caps| Dn::new(&caps[1]))
}

/// ContactStatusDetail status vocabulary.
fn contact_status_signal(status: &str) -> PresenceSignal {
    match status {
        "Created" | "Reachable" | "NonQualified" => PresenceSignal::Reachable,
        "Removed" | "Unreachable" => PresenceSignal::Unreachable,
        _ => PresenceSignal::Unknown,
    }
}

/// PeerStatus status vocabulary.
fn peer_status_signal(status: &str) -> PresenceSignal {
    match status {
        "Registered" | "Reachable" => PresenceSignal::Reachable,
        "Unregistered" | "Unreachable" | "Rejected" => PresenceSignal::Unreachable,
        _ => PresenceSignal::Unknown,
    }
}

/// DeviceStateChange state vocabulary. `NOT_INUSE` fires when a device is
/// merely idle, not necessarily registered, so only `UNAVAILABLE` maps to a
/// transition-worthy signal.
fn device_state_signal(state: &str) -> PresenceSignal {
    match state {
        "UNAVAILABLE" => PresenceSignal::Unreachable,
        _ => PresenceSignal::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range_scope() -> MonitorScope {
        MonitorScope::Range { start: 5001, end: 5020 }
    }

    fn ami(name: &str, fields: &[(&str, &str)]) -> AmiEvent {
        AmiEvent::new(
            name,
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_ingestion_closed_set() {
        assert!(PresenceEvent::from_ami(&ami("Newchannel", &[])).is_none());
        assert!(PresenceEvent::from_ami(&ami("FullyBooted", &[("Status", "Fully Booted")])).is_none());
        assert!(
            PresenceEvent::from_ami(&ami("PeerStatus", &[("Peer", "PJSIP/5001")])).is_some()
        );
    }

    #[test]
    fn test_contact_status_dn_from_aor() {
        let ev = PresenceEvent::ContactStatus {
            aor: "5002/sip:5002@10.8.0.5:8901".to_string(),
            status: "Reachable".to_string(),
        };
        let (dn, signal) = classify(&ev, &range_scope()).unwrap();
        assert_eq!(dn.as_str(), "5002");
        assert_eq!(signal, PresenceSignal::Reachable);
    }

    #[test]
    fn test_contact_status_vocabulary() {
        for status in ["Created", "Reachable", "NonQualified"] {
            assert_eq!(contact_status_signal(status), PresenceSignal::Reachable);
        }
        for status in ["Removed", "Unreachable"] {
            assert_eq!(contact_status_signal(status), PresenceSignal::Unreachable);
        }
        for status in ["Updated", "Unknown", ""] {
            assert_eq!(contact_status_signal(status), PresenceSignal::Unknown);
        }
    }

    #[test]
    fn test_peer_status_vocabulary() {
        for status in ["Registered", "Reachable"] {
            assert_eq!(peer_status_signal(status), PresenceSignal::Reachable);
        }
        for status in ["Unregistered", "Unreachable", "Rejected"] {
            assert_eq!(peer_status_signal(status), PresenceSignal::Unreachable);
        }
        for status in ["Lagged", ""] {
            assert_eq!(peer_status_signal(status), PresenceSignal::Unknown);
        }
    }

    #[test]
    fn test_device_state_idle_is_unknown() {
        assert_eq!(device_state_signal("NOT_INUSE"), PresenceSignal::Unknown);
        assert_eq!(device_state_signal("INUSE"), PresenceSignal::Unknown);
        assert_eq!(device_state_signal("UNAVAILABLE"), PresenceSignal::Unreachable);
    }

    #[test]
    fn test_peer_composite_extraction() {
        assert_eq!(peer_dn("PJSIP/5001").unwrap().as_str(), "5001");
        assert!(peer_dn("SIP/5001").is_none());
        assert!(peer_dn("PJSIP/abc").is_none());
        assert!(peer_dn("PJSIP/5001/extra").is_none());
        assert!(peer_dn("").is_none());
    }

    #[test]
    fn test_out_of_scope_dn_filtered() {
        let ev = PresenceEvent::PeerStatus {
            peer: "PJSIP/1002".to_string(),
            status: "Unreachable".to_string(),
        };
        assert!(classify(&ev, &range_scope()).is_none());
    }

    #[test]
    fn test_in_scope_unknown_status_classifies_unknown() {
        let ev = PresenceEvent::PeerStatus {
            peer: "PJSIP/5005".to_string(),
            status: "Lagged".to_string(),
        };
        let (dn, signal) = classify(&ev, &range_scope()).unwrap();
        assert_eq!(dn.as_str(), "5005");
        assert_eq!(signal, PresenceSignal::Unknown);
    }

    #[test]
    fn test_aor_without_separator() {
        let ev = PresenceEvent::ContactStatus {
            aor: "5003".to_string(),
            status: "Removed".to_string(),
        };
        let (dn, signal) = classify(&ev, &range_scope()).unwrap();
        assert_eq!(dn.as_str(), "5003");
        assert_eq!(signal, PresenceSignal::Unreachable);
    }

    #[test]
    fn test_empty_fields_classify_none() {
        let ev = PresenceEvent::ContactStatus {
            aor: String::new(),
            status: "Reachable".to_string(),
        };
        assert!(classify(&ev, &range_scope()).is_none());
    }
}
