//! Remote registration driver
//!
//! Wraps the outbound-registration action pair against the remote
//! call-routing peer. The driver trusts its caller: idempotence comes from
//! the ledger check in the reconciliation state machine, so `register` and
//! `unregister` never re-check remote state themselves, and the driver
//! never retries on its own - retries are driven by future presence events.
//!
//! The one exception is the "registration object not found" path: when the
//! remote reports that no registration object exists for a DN, the driver
//! synthesizes the minimal object through a config-append action, reloads
//! the PJSIP module so it takes effect, and retries the register action
//! exactly once.

use crate::channel::{AmiAction, AmiClient, AmiResponse};
use crate::error::{RegsyncError, Result};
use crate::types::Dn;
use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

/// Module reloaded after synthesizing a registration object.
const PJSIP_MODULE: &str = "res_pjsip.so";

/// Configuration file holding outbound registration objects.
const PJSIP_CONF: &str = "pjsip.conf";

/// Seam between the state machine and the remote peer.
///
/// The production implementation is [`AmiRegistrationDriver`]; tests mock
/// this trait to script driver outcomes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegistrationDriver: Send + Sync {
    /// Start the outbound registration for a DN.
    async fn register(&self, dn: &Dn) -> Result<()>;

    /// Stop the outbound registration for a DN. Absence of the
    /// registration is success (already converged).
    async fn unregister(&self, dn: &Dn) -> Result<()>;
}

/// Remote peer parameters used when synthesizing registration objects.
#[derive(Debug, Clone)]
pub struct RemotePeer {
    /// Remote SIP server host.
    pub host: String,
    /// Remote SIP server port.
    pub port: u16,
    /// PJSIP transport name the registration rides on.
    pub transport: String,
    /// Outbound auth password; when set, an auth section is synthesized
    /// alongside the registration and referenced from it.
    pub auth_password: Option<String>,
}

/// Deterministic registration object name for a DN.
pub fn registration_name(dn: &Dn) -> String {
    format!("genesys_reg_{}", dn)
}

/// True if a failure response means the registration object does not
/// exist. The management protocol reports this only as message text.
fn is_not_found(resp: &AmiResponse) -> bool {
    resp.message_text().to_ascii_lowercase().contains("not found")
}

/// AMI-backed driver issuing actions against the remote peer's control
/// surface through the shared management channel.
pub struct AmiRegistrationDriver {
    client: AmiClient,
    remote: RemotePeer,
}

impl AmiRegistrationDriver {
    /// Create a driver over an authenticated management channel.
    pub fn new(client: AmiClient, remote: RemotePeer) -> Self {
        Self { client, remote }
    }

    /// Synthesize the minimal registration object for a DN and reload the
    /// PJSIP module so it takes effect.
    ///
    /// The object carries no automatic retry policy (`max_retries=0`);
    /// this engine owns the retry decision.
    #[instrument(skip(self))]
    async fn synthesize_registration(&self, dn: &Dn) -> Result<()> {
        let reg_name = registration_name(dn);
        let uri = format!("sip:{}@{}:{}", dn, self.remote.host, self.remote.port);
        info!(dn = %dn, registration = %reg_name, "Synthesizing registration object");

        let mut update = AmiAction::new("UpdateConfig")
            .field("SrcFilename", PJSIP_CONF)
            .field("DstFilename", PJSIP_CONF)
            .field("Reload", "no");
        let mut idx = 0usize;

        let mut push = |action: &mut AmiAction, op: &str, cat: &str, var: &str, value: &str| {
            let mut a = std::mem::replace(action, AmiAction::new("UpdateConfig"));
            a = a.field(format!("Action-{:06}", idx), op);
            a = a.field(format!("Cat-{:06}", idx), cat);
            if !var.is_empty() {
                a = a.field(format!("Var-{:06}", idx), var);
                a = a.field(format!("Value-{:06}", idx), value);
            }
            *action = a;
            idx += 1;
        };

        let auth_name = format!("genesys_auth_{}", dn);
        if self.remote.auth_password.is_some() {
            push(&mut update, "NewCat", &auth_name, "", "");
            push(&mut update, "Append", &auth_name, "type", "auth");
            push(&mut update, "Append", &auth_name, "auth_type", "userpass");
            push(&mut update, "Append", &auth_name, "username", dn.as_str());
            let password = self.remote.auth_password.clone().unwrap_or_default();
            push(&mut update, "Append", &auth_name, "password", &password);
        }

        push(&mut update, "NewCat", &reg_name, "", "");
        push(&mut update, "Append", &reg_name, "type", "registration");
        push(&mut update, "Append", &reg_name, "transport", &self.remote.transport);
        push(&mut update, "Append", &reg_name, "server_uri", &uri);
        push(&mut update, "Append", &reg_name, "client_uri", &uri);
        push(&mut update, "Append", &reg_name, "retry_interval", "0");
        push(&mut update, "Append", &reg_name, "max_retries", "0");
        if self.remote.auth_password.is_some() {
            push(&mut update, "Append", &reg_name, "outbound_auth", &auth_name);
        }

        let resp = self.client.send_action(update).await?;
        if !resp.success {
            return Err(RegsyncError::ActionFailure {
                action: "UpdateConfig".to_string(),
                message: resp.message_text().to_string(),
            });
        }

        let resp = self
            .client
            .send_action(AmiAction::new("Reload").field("Module", PJSIP_MODULE))
            .await?;
        if !resp.success {
            return Err(RegsyncError::ActionFailure {
                action: "Reload".to_string(),
                message: resp.message_text().to_string(),
            });
        }

        debug!(dn = %dn, "Registration object synthesized and module reloaded");
        Ok(())
    }

    async fn send_register(&self, reg_name: &str) -> Result<AmiResponse> {
        self.client
            .send_action(AmiAction::new("PJSIPRegister").field("Registration", reg_name))
            .await
    }
}

#[async_trait]
impl RegistrationDriver for AmiRegistrationDriver {
    #[instrument(skip(self), fields(dn = %dn))]
    async fn register(&self, dn: &Dn) -> Result<()> {
        let reg_name = registration_name(dn);

        // Clear any stale registration first so a fresh REGISTER goes out.
        // Best effort; a failure here carries no information.
        let _ = self
            .client
            .send_action(AmiAction::new("PJSIPUnregister").field("Registration", &reg_name))
            .await;

        let resp = self.send_register(&reg_name).await?;
        if resp.success {
            return Ok(());
        }

        if is_not_found(&resp) {
            self.synthesize_registration(dn).await?;
            let retry = self.send_register(&reg_name).await?;
            if retry.success {
                return Ok(());
            }
            return Err(RegsyncError::ActionFailure {
                action: "PJSIPRegister".to_string(),
                message: retry.message_text().to_string(),
            });
        }

        Err(RegsyncError::ActionFailure {
            action: "PJSIPRegister".to_string(),
            message: resp.message_text().to_string(),
        })
    }

    #[instrument(skip(self), fields(dn = %dn))]
    async fn unregister(&self, dn: &Dn) -> Result<()> {
        let reg_name = registration_name(dn);
        let resp = self
            .client
            .send_action(AmiAction::new("PJSIPUnregister").field("Registration", &reg_name))
            .await?;

        if resp.success {
            return Ok(());
        }
        if is_not_found(&resp) {
            // Already converged.
            debug!(dn = %dn, "Registration already absent on unregister");
            return Ok(());
        }
        warn!(dn = %dn, message = resp.message_text(), "Unregister action failed");
        Err(RegsyncError::ActionFailure {
            action: "PJSIPUnregister".to_string(),
            message: resp.message_text().to_string(),
        })
    }
}
