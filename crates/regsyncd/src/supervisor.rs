//! Supervisor and reconnect loop
//!
//! Owns the engine for the process lifetime, detects channel loss through
//! the client's liveness predicate, reconnects with a fixed short backoff,
//! and forces a full resync after every reconnect. The retry domain is
//! small and bounded, so the backoff never grows past the steady retry
//! delay.

use crate::channel::{AmiAction, AmiClient};
use crate::config::RegsyncConfig;
use crate::driver::AmiRegistrationDriver;
use crate::metrics::MetricsCollector;
use crate::reconcile::{LedgerHandle, RegSync};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Delay before the first reconnect attempt after a detected loss.
pub const RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(5);

/// Delay between subsequent failed reconnect attempts.
pub const RECONNECT_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Interval for polling the liveness predicate while idle.
const LIVENESS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Management channel state as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Session established and authenticated.
    Connected,
    /// Liveness predicate reported the session dead.
    Disconnected,
    /// Waiting out the backoff before the next connect attempt.
    Reconnecting,
}

impl ChannelState {
    /// State name for structured logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Connected => "connected",
            ChannelState::Disconnected => "disconnected",
            ChannelState::Reconnecting => "reconnecting",
        }
    }
}

/// How a connected session ended.
enum SessionEnd {
    /// Cancellation token fired; shutdown sweep already ran.
    Shutdown,
    /// Channel died; the supervisor should reconnect.
    ConnectionLost,
}

/// Drives connect / process / reconnect for the engine.
pub struct Supervisor {
    config: RegsyncConfig,
    engine: RegSync,
    metrics: MetricsCollector,
    state: ChannelState,
}

impl Supervisor {
    /// Create a supervisor with a fresh engine (empty ledger).
    pub fn new(config: RegsyncConfig, metrics: MetricsCollector) -> Self {
        let engine = RegSync::new(config.scope(), metrics.clone());
        Self {
            config,
            engine,
            metrics,
            state: ChannelState::Disconnected,
        }
    }

    /// Shared ledger view for the status server.
    pub fn ledger_handle(&self) -> LedgerHandle {
        self.engine.ledger_handle()
    }

    fn set_state(&mut self, state: ChannelState) {
        if self.state != state {
            info!(
                from = self.state.as_str(),
                to = state.as_str(),
                "Channel state changed"
            );
            self.state = state;
        }
    }

    /// Run until the cancellation token fires.
    ///
    /// Connection loss never propagates as an error; it feeds the
    /// reconnect loop. The engine and its ledger survive across sessions,
    /// which is what makes the post-reconnect resync meaningful.
    #[instrument(skip_all)]
    pub async fn run(&mut self, token: CancellationToken) -> crate::error::Result<()> {
        let mut first_connection = true;
        let mut first_retry = true;

        loop {
            if token.is_cancelled() {
                break;
            }
            if !first_connection {
                self.metrics.record_reconnect();
            }

            match self.run_session(&token, first_connection).await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::ConnectionLost) => {
                    self.set_state(ChannelState::Disconnected);
                    self.metrics.set_channel_connected(false);
                    warn!("Management channel lost");
                    first_connection = false;
                    first_retry = true;
                }
                Err(e) => {
                    self.set_state(ChannelState::Disconnected);
                    self.metrics.set_channel_connected(false);
                    warn!(error = %e, "Connect attempt failed");
                    first_connection = false;
                }
            }

            let delay = if first_retry {
                RECONNECT_INITIAL_DELAY
            } else {
                RECONNECT_RETRY_DELAY
            };
            first_retry = false;
            self.set_state(ChannelState::Reconnecting);
            debug!(delay_secs = delay.as_secs(), "Backing off before reconnect");
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Supervisor stopped");
        Ok(())
    }

    /// One connected session: connect, resync if this is a reconnect, then
    /// process events until shutdown or channel loss.
    async fn run_session(
        &mut self,
        token: &CancellationToken,
        first_connection: bool,
    ) -> crate::error::Result<SessionEnd> {
        let (client, mut events) = AmiClient::connect(
            &self.config.asterisk.host,
            self.config.asterisk.ami_port,
            &self.config.asterisk.ami_user,
            &self.config.asterisk.ami_secret,
            self.config.action_timeout(),
        )
        .await?;

        self.set_state(ChannelState::Connected);
        self.metrics.set_channel_connected(true);
        info!(
            host = %self.config.asterisk.host,
            port = self.config.asterisk.ami_port,
            "Management channel connected"
        );

        let driver = AmiRegistrationDriver::new(client.clone(), self.config.remote_peer());

        // Prime the event feed with the current contact table. Failure is
        // informational only; live events carry the same data.
        if let Err(e) = client.send_action(AmiAction::new("PJSIPShowContacts")).await {
            warn!(error = %e, "Initial contact query failed");
        }

        if !first_connection {
            // The remote switch may have restarted and silently dropped
            // everything the ledger still believes in.
            self.engine.resync(&driver).await;
        }

        let mut liveness = tokio::time::interval(LIVENESS_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Shutdown requested, sweeping ledger");
                    self.engine.shutdown_sweep(&driver).await;
                    return Ok(SessionEnd::Shutdown);
                }
                maybe_event = events.recv() => match maybe_event {
                    Some(event) => self.engine.apply_event(&driver, &event).await,
                    None => return Ok(SessionEnd::ConnectionLost),
                },
                _ = liveness.tick() => {
                    if !client.is_alive() {
                        return Ok(SessionEnd::ConnectionLost);
                    }
                }
            }
        }
    }
}
