//! Registration reconciliation state machine
//!
//! Holds the per-DN transition state and the registration ledger - the
//! set of DNs currently believed to be registered with the remote peer.
//! This module is the only write path to both; the classifier and the
//! supervisor request transitions but never mutate state directly.
//!
//! Events are applied strictly in arrival order and each driver call runs
//! to completion before the next event is applied, so per-DN ordering
//! holds without any locking.
//!
//! The ledger is belief, not ground truth: an entry is added only after a
//! successful register action, and removed after an unregister action
//! whether it succeeded or not. A failed unregister leaves the true remote
//! state ambiguous; the entry is dropped optimistically so the DN cannot
//! get stuck unreachable behind a stale ledger entry.

use crate::channel::AmiEvent;
use crate::classify::{PresenceEvent, classify};
use crate::driver::RegistrationDriver;
use crate::metrics::MetricsCollector;
use crate::types::{Dn, DnState, MonitorScope, PresenceSignal};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Overall deadline for the best-effort unregister sweep at shutdown.
pub const SHUTDOWN_SWEEP_DEADLINE: Duration = Duration::from_secs(10);

/// Shared read-only view of the ledger.
///
/// Published by the engine after every ledger mutation so the status
/// server answers from in-memory state without touching the engine or the
/// network.
#[derive(Clone, Default)]
pub struct LedgerHandle(Arc<RwLock<BTreeSet<Dn>>>);

impl LedgerHandle {
    /// Current ledger contents, ascending.
    pub fn snapshot(&self) -> Vec<Dn> {
        self.0.read().iter().cloned().collect()
    }

    /// Number of DNs believed registered.
    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    /// True when nothing is believed registered.
    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }
}

/// Reconciliation engine: observed presence in, converge actions out.
pub struct RegSync {
    scope: MonitorScope,
    states: HashMap<Dn, DnState>,
    ledger: BTreeSet<Dn>,
    shared: LedgerHandle,
    metrics: MetricsCollector,
}

impl RegSync {
    /// Create an engine with an empty ledger.
    ///
    /// Desired state starts `false` for every DN: observed presence drives
    /// remote registrations up, persisted remote state is never trusted on
    /// boot.
    pub fn new(scope: MonitorScope, metrics: MetricsCollector) -> Self {
        Self {
            scope,
            states: HashMap::new(),
            ledger: BTreeSet::new(),
            shared: LedgerHandle::default(),
            metrics,
        }
    }

    /// Shared handle for the status server.
    pub fn ledger_handle(&self) -> LedgerHandle {
        self.shared.clone()
    }

    /// Current ledger contents, ascending.
    pub fn snapshot(&self) -> Vec<Dn> {
        self.ledger.iter().cloned().collect()
    }

    /// True if the DN is believed registered with the remote peer.
    pub fn is_registered(&self, dn: &Dn) -> bool {
        self.ledger.contains(dn)
    }

    /// Classify a raw management event and apply the resulting signal.
    ///
    /// Failures here never abort the channel: unparseable or out-of-scope
    /// events are counted and dropped.
    pub async fn apply_event(&mut self, driver: &dyn RegistrationDriver, event: &AmiEvent) {
        let Some(presence) = PresenceEvent::from_ami(event) else {
            self.metrics.record_event_discarded();
            return;
        };
        let Some((dn, signal)) = classify(&presence, &self.scope) else {
            self.metrics.record_event_discarded();
            return;
        };
        self.metrics.record_event();
        debug!(dn = %dn, signal = signal.as_str(), event = %event.name, "Classified presence event");
        self.apply_signal(driver, dn, signal).await;
    }

    /// Apply a normalized presence signal for a monitored DN.
    #[instrument(skip(self, driver), fields(dn = %dn, signal = signal.as_str()))]
    pub async fn apply_signal(
        &mut self,
        driver: &dyn RegistrationDriver,
        dn: Dn,
        signal: PresenceSignal,
    ) {
        let state = self.states.get(&dn).copied().unwrap_or_default();
        match signal {
            PresenceSignal::Unknown => {}
            PresenceSignal::Reachable => match state {
                DnState::Registering | DnState::Registered => {
                    debug!(state = state.as_str(), "Duplicate reachable signal, no-op");
                }
                DnState::Unregistered | DnState::Unregistering => {
                    self.register(driver, dn).await;
                }
            },
            PresenceSignal::Unreachable => match state {
                DnState::Unregistering | DnState::Unregistered => {
                    debug!(state = state.as_str(), "Unreachable while not registered, no-op");
                }
                DnState::Registered | DnState::Registering => {
                    self.unregister(driver, dn).await;
                }
            },
        }
    }

    async fn register(&mut self, driver: &dyn RegistrationDriver, dn: Dn) {
        info!(dn = %dn, "Registering DN with remote peer");
        self.states.insert(dn.clone(), DnState::Registering);

        match driver.register(&dn).await {
            Ok(()) => {
                self.metrics.record_register(true);
                self.states.insert(dn.clone(), DnState::Registered);
                self.ledger.insert(dn.clone());
                self.publish();
                info!(dn = %dn, "DN registered with remote peer");
            }
            Err(e) => {
                // No ledger entry; the next reachable signal retries.
                self.metrics.record_register(false);
                self.states.insert(dn.clone(), DnState::Unregistered);
                warn!(dn = %dn, error = %e, "Register action failed");
            }
        }
    }

    async fn unregister(&mut self, driver: &dyn RegistrationDriver, dn: Dn) {
        info!(dn = %dn, "Unregistering DN from remote peer");
        self.states.insert(dn.clone(), DnState::Unregistering);

        match driver.unregister(&dn).await {
            Ok(()) => {
                self.metrics.record_unregister(true);
                info!(dn = %dn, "DN unregistered from remote peer");
            }
            Err(e) => {
                self.metrics.record_unregister(false);
                warn!(dn = %dn, error = %e, "Unregister action failed, dropping ledger entry anyway");
            }
        }
        // Optimistic removal either way; the ledger tracks belief and a
        // stuck entry would leave the DN permanently unreachable.
        self.states.insert(dn.clone(), DnState::Unregistered);
        self.ledger.remove(&dn);
        self.publish();
    }

    /// Forced full resync: treat every configured DN as freshly
    /// unreachable, ignoring the ledger's belief.
    ///
    /// Runs after a reconnect, when the remote switch may have restarted
    /// and silently cleared registration state the ledger still believes
    /// in. Issues exactly one unregister per configured DN.
    #[instrument(skip_all)]
    pub async fn resync(&mut self, driver: &dyn RegistrationDriver) {
        let dns = self.scope.dns();
        info!(dn_count = dns.len(), "Starting forced resync");
        self.metrics.record_resync();

        for dn in &dns {
            if let Err(e) = driver.unregister(dn).await {
                debug!(dn = %dn, error = %e, "Resync unregister failed (ignored)");
            }
        }

        self.states.clear();
        self.ledger.clear();
        self.publish();
        info!("Forced resync complete, ledger cleared");
    }

    /// Best-effort unregister of every ledger entry under one short
    /// overall deadline. Shutdown proceeds regardless of outcome.
    #[instrument(skip_all)]
    pub async fn shutdown_sweep(&mut self, driver: &dyn RegistrationDriver) {
        let entries: Vec<Dn> = self.ledger.iter().cloned().collect();
        if entries.is_empty() {
            return;
        }
        info!(dn_count = entries.len(), "Shutdown: unregistering ledger entries");

        let sweep = async {
            for dn in &entries {
                if let Err(e) = driver.unregister(dn).await {
                    warn!(dn = %dn, error = %e, "Shutdown unregister failed");
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_SWEEP_DEADLINE, sweep).await.is_err() {
            warn!("Shutdown sweep deadline exceeded, proceeding anyway");
        }

        self.states.clear();
        self.ledger.clear();
        self.publish();
    }

    fn publish(&self) {
        *self.shared.0.write() = self.ledger.clone();
        self.metrics.set_ledger_size(self.ledger.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockRegistrationDriver;
    use crate::error::RegsyncError;
    use mockall::Sequence;
    use mockall::predicate::eq;

    fn engine(start: u32, end: u32) -> RegSync {
        RegSync::new(
            MonitorScope::Range { start, end },
            MetricsCollector::new().unwrap(),
        )
    }

    fn action_failure() -> RegsyncError {
        RegsyncError::ActionFailure {
            action: "PJSIPRegister".to_string(),
            message: "boom".to_string(),
        }
    }

    #[tokio::test]
    async fn test_reachable_registers_once() {
        let mut driver = MockRegistrationDriver::new();
        driver
            .expect_register()
            .with(eq(Dn::new("5001")))
            .times(1)
            .returning(|_| Ok(()));

        let mut sync = engine(5001, 5020);
        sync.apply_signal(&driver, Dn::new("5001"), PresenceSignal::Reachable)
            .await;
        // Duplicate reachable with no intervening unreachable: no-op.
        sync.apply_signal(&driver, Dn::new("5001"), PresenceSignal::Reachable)
            .await;

        assert!(sync.is_registered(&Dn::new("5001")));
        assert_eq!(sync.ledger_handle().len(), 1);
    }

    #[tokio::test]
    async fn test_round_trip_register_then_unregister() {
        let mut driver = MockRegistrationDriver::new();
        let mut seq = Sequence::new();
        driver
            .expect_register()
            .with(eq(Dn::new("5001")))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        driver
            .expect_unregister()
            .with(eq(Dn::new("5001")))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let mut sync = engine(5001, 5020);
        sync.apply_signal(&driver, Dn::new("5001"), PresenceSignal::Reachable)
            .await;
        sync.apply_signal(&driver, Dn::new("5001"), PresenceSignal::Unreachable)
            .await;

        assert!(sync.snapshot().is_empty());
        assert!(sync.ledger_handle().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_when_absent_is_noop() {
        // No expectations: any driver call panics the test.
        let driver = MockRegistrationDriver::new();
        let mut sync = engine(1001, 1010);
        sync.apply_signal(&driver, Dn::new("1002"), PresenceSignal::Unreachable)
            .await;
        assert!(sync.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_never_triggers() {
        let driver = MockRegistrationDriver::new();
        let mut sync = engine(5001, 5020);
        sync.apply_signal(&driver, Dn::new("5001"), PresenceSignal::Unknown)
            .await;
        assert!(sync.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_scope_event_never_reaches_driver() {
        let driver = MockRegistrationDriver::new();
        let mut sync = engine(5001, 5020);
        let event = AmiEvent::new(
            "PeerStatus",
            vec![
                ("Peer".to_string(), "PJSIP/9999".to_string()),
                ("PeerStatus".to_string(), "Registered".to_string()),
            ],
        );
        sync.apply_event(&driver, &event).await;
        assert!(sync.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_register_failure_retried_on_next_signal() {
        let mut driver = MockRegistrationDriver::new();
        let mut seq = Sequence::new();
        driver
            .expect_register()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(action_failure()));
        driver
            .expect_register()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let mut sync = engine(5001, 5020);
        sync.apply_signal(&driver, Dn::new("5001"), PresenceSignal::Reachable)
            .await;
        assert!(!sync.is_registered(&Dn::new("5001")));

        sync.apply_signal(&driver, Dn::new("5001"), PresenceSignal::Reachable)
            .await;
        assert!(sync.is_registered(&Dn::new("5001")));
    }

    #[tokio::test]
    async fn test_optimistic_removal_on_failed_unregister() {
        let mut driver = MockRegistrationDriver::new();
        driver.expect_register().times(1).returning(|_| Ok(()));
        driver
            .expect_unregister()
            .times(1)
            .returning(|_| {
                Err(RegsyncError::ActionFailure {
                    action: "PJSIPUnregister".to_string(),
                    message: "remote error".to_string(),
                })
            });

        let mut sync = engine(5001, 5020);
        sync.apply_signal(&driver, Dn::new("5001"), PresenceSignal::Reachable)
            .await;
        sync.apply_signal(&driver, Dn::new("5001"), PresenceSignal::Unreachable)
            .await;

        // Ledger entry dropped even though the call failed.
        assert!(sync.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_resync_sweeps_every_configured_dn_once() {
        let mut driver = MockRegistrationDriver::new();
        for dn in ["5001", "5002", "5003"] {
            driver
                .expect_unregister()
                .with(eq(Dn::new(dn)))
                .times(1)
                .returning(|_| Ok(()));
        }
        driver.expect_register().times(1).returning(|_| Ok(()));

        let mut sync = engine(5001, 5003);
        sync.apply_signal(&driver, Dn::new("5002"), PresenceSignal::Reachable)
            .await;
        assert_eq!(sync.snapshot().len(), 1);

        sync.resync(&driver).await;

        assert!(sync.snapshot().is_empty());
        assert!(sync.ledger_handle().is_empty());
    }

    #[tokio::test]
    async fn test_resync_failures_ignored() {
        let mut driver = MockRegistrationDriver::new();
        driver
            .expect_unregister()
            .times(2)
            .returning(|_| Err(action_failure()));

        let mut sync = engine(5001, 5002);
        sync.resync(&driver).await;
        assert!(sync.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_registration_possible_after_resync() {
        let mut driver = MockRegistrationDriver::new();
        driver.expect_unregister().times(2).returning(|_| Ok(()));
        driver
            .expect_register()
            .with(eq(Dn::new("5001")))
            .times(1)
            .returning(|_| Ok(()));

        let mut sync = engine(5001, 5002);
        sync.resync(&driver).await;
        sync.apply_signal(&driver, Dn::new("5001"), PresenceSignal::Reachable)
            .await;
        assert!(sync.is_registered(&Dn::new("5001")));
    }

    #[tokio::test]
    async fn test_shutdown_sweep_drains_ledger() {
        let mut driver = MockRegistrationDriver::new();
        driver.expect_register().times(2).returning(|_| Ok(()));
        driver
            .expect_unregister()
            .times(2)
            .returning(|_| Ok(()));

        let mut sync = engine(5001, 5020);
        sync.apply_signal(&driver, Dn::new("5001"), PresenceSignal::Reachable)
            .await;
        sync.apply_signal(&driver, Dn::new("5002"), PresenceSignal::Reachable)
            .await;
        assert_eq!(sync.snapshot().len(), 2);

        sync.shutdown_sweep(&driver).await;
        assert!(sync.snapshot().is_empty());
        assert!(sync.ledger_handle().is_empty());
    }

    #[tokio::test]
    async fn test_contact_status_event_flows_to_register() {
        let mut driver = MockRegistrationDriver::new();
        driver
            .expect_register()
            .with(eq(Dn::new("5002")))
            .times(1)
            .returning(|_| Ok(()));

        let mut sync = engine(5001, 5020);
        let event = AmiEvent::new(
            "ContactStatusDetail",
            vec![
                ("AOR".to_string(), "5002/sip:5002@10.8.0.5".to_string()),
                ("Status".to_string(), "Reachable".to_string()),
            ],
        );
        sync.apply_event(&driver, &event).await;
        assert!(sync.is_registered(&Dn::new("5002")));
    }
}
