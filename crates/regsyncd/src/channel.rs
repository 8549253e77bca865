//! Management channel client for the local switch's AMI control interface
//!
//! Maintains one authenticated session and exposes the two primitives the
//! engine needs: send-action-and-await-response and an ordered inbound event
//! stream. The wire format is the given flat `Key: Value` record framing;
//! this module only implements session semantics on top of it - response
//! correlation via `ActionID`, event demultiplexing, bounded waits, and a
//! liveness predicate for the supervisor.
//!
//! The handshake is generic over any `AsyncRead + AsyncWrite` stream so
//! tests can drive a scripted peer through `tokio::io::duplex`.

use crate::error::{RegsyncError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument, trace, warn};

/// Bound on the inbound event queue. Presence events are small and the DN
/// domain is bounded, so a modest queue is plenty.
const EVENT_QUEUE_DEPTH: usize = 256;

/// Timeout for establishing the TCP session.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// An outbound management action (request half of a request/response pair).
#[derive(Debug, Clone)]
pub struct AmiAction {
    name: String,
    fields: Vec<(String, String)>,
}

impl AmiAction {
    /// Create an action with the given AMI action name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Append a header field (builder style).
    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    /// The AMI action name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The header fields, in insertion order.
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }
}

/// Response to a management action.
#[derive(Debug, Clone)]
pub struct AmiResponse {
    /// Whether the remote reported success.
    pub success: bool,
    /// Optional message text from the response.
    pub message: Option<String>,
}

impl AmiResponse {
    /// Message text, or an empty string when the response carried none.
    pub fn message_text(&self) -> &str {
        self.message.as_deref().unwrap_or("")
    }
}

/// An asynchronous event delivered by the local switch.
#[derive(Debug, Clone)]
pub struct AmiEvent {
    /// Event name (e.g., "PeerStatus").
    pub name: String,
    fields: Vec<(String, String)>,
}

impl AmiEvent {
    /// Build an event from a name and field pairs.
    pub fn new(name: impl Into<String>, fields: Vec<(String, String)>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// Look up a header field by exact key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

type Record = Vec<(String, String)>;

struct ClientInner {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<AmiResponse>>>,
    next_action_id: AtomicU64,
    alive: AtomicBool,
    action_timeout: Duration,
}

/// Authenticated management channel session.
///
/// Cloning is cheap; all clones share the one underlying session. Events
/// are delivered to the single receiver returned by [`AmiClient::connect`] /
/// [`AmiClient::handshake`], in arrival order.
#[derive(Clone)]
pub struct AmiClient {
    inner: Arc<ClientInner>,
}

impl AmiClient {
    /// Connect to the switch's management port and authenticate.
    ///
    /// Fails with [`RegsyncError::Connection`] on transport or auth failure.
    #[instrument(skip(secret))]
    pub async fn connect(
        host: &str,
        port: u16,
        username: &str,
        secret: &str,
        action_timeout: Duration,
    ) -> Result<(Self, mpsc::Receiver<AmiEvent>)> {
        debug!(host, port, "Connecting to management channel");

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                RegsyncError::Connection(format!("connect to {}:{} timed out", host, port))
            })?
            .map_err(|e| {
                RegsyncError::Connection(format!("connect to {}:{} failed: {}", host, port, e))
            })?;

        Self::handshake(stream, username, secret, action_timeout).await
    }

    /// Perform the session handshake over an already-established stream.
    ///
    /// Validates the protocol banner, spawns the reader task, and logs in.
    /// A peer that does not present the management banner fails with
    /// [`RegsyncError::Protocol`].
    pub async fn handshake<S>(
        stream: S,
        username: &str,
        secret: &str,
        action_timeout: Duration,
    ) -> Result<(Self, mpsc::Receiver<AmiEvent>)>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        let mut banner = String::new();
        let n = reader
            .read_line(&mut banner)
            .await
            .map_err(|e| RegsyncError::Connection(format!("banner read failed: {}", e)))?;
        if n == 0 {
            return Err(RegsyncError::Connection(
                "channel closed before banner".to_string(),
            ));
        }
        let banner = banner.trim();
        if !banner.contains("Asterisk Call Manager") {
            return Err(RegsyncError::Protocol(format!(
                "unexpected banner: '{}'",
                banner
            )));
        }
        debug!(banner, "Received management channel banner");

        let inner = Arc::new(ClientInner {
            writer: tokio::sync::Mutex::new(Box::new(write_half) as Box<dyn AsyncWrite + Send + Unpin>),
            pending: Mutex::new(HashMap::new()),
            next_action_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
            action_timeout,
        });

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        tokio::spawn(read_loop(reader, Arc::clone(&inner), events_tx));

        let client = Self { inner };

        let login = AmiAction::new("Login")
            .field("Username", username)
            .field("Secret", secret);
        let resp = client.send_action(login).await?;
        if !resp.success {
            return Err(RegsyncError::Connection(format!(
                "authentication rejected: {}",
                resp.message_text()
            )));
        }
        debug!("Management channel authenticated");

        Ok((client, events_rx))
    }

    /// Send an action and await its correlated response.
    ///
    /// Fails with [`RegsyncError::Timeout`] after the bounded wait and with
    /// [`RegsyncError::Connection`] if the session dies mid-flight.
    pub async fn send_action(&self, action: AmiAction) -> Result<AmiResponse> {
        if !self.is_alive() {
            return Err(RegsyncError::Connection("channel is down".to_string()));
        }

        let id = self.inner.next_action_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, tx);

        let mut buf = String::with_capacity(128);
        buf.push_str("Action: ");
        buf.push_str(action.name());
        buf.push_str("\r\nActionID: ");
        buf.push_str(&id.to_string());
        buf.push_str("\r\n");
        for (key, value) in action.fields() {
            buf.push_str(key);
            buf.push_str(": ");
            buf.push_str(value);
            buf.push_str("\r\n");
        }
        buf.push_str("\r\n");

        {
            let mut writer = self.inner.writer.lock().await;
            if let Err(e) = writer.write_all(buf.as_bytes()).await {
                self.inner.pending.lock().remove(&id);
                self.inner.alive.store(false, Ordering::Release);
                return Err(RegsyncError::Connection(format!("write failed: {}", e)));
            }
            if let Err(e) = writer.flush().await {
                self.inner.pending.lock().remove(&id);
                self.inner.alive.store(false, Ordering::Release);
                return Err(RegsyncError::Connection(format!("flush failed: {}", e)));
            }
        }

        trace!(action = action.name(), action_id = id, "Sent action");

        match tokio::time::timeout(self.inner.action_timeout, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(RegsyncError::Connection(
                "channel closed while awaiting response".to_string(),
            )),
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                Err(RegsyncError::Timeout {
                    action: action.name().to_string(),
                    secs: self.inner.action_timeout.as_secs(),
                })
            }
        }
    }

    /// Liveness predicate for the supervisor.
    ///
    /// Flips false when the reader task observes EOF or a socket error, so
    /// silent death is detected, not just explicit disconnects.
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }
}

/// Reader task: demultiplexes inbound records into correlated responses and
/// the event stream. Runs until the stream errors or closes.
async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: BufReader<ReadHalf<R>>,
    inner: Arc<ClientInner>,
    events_tx: mpsc::Sender<AmiEvent>,
) {
    loop {
        match read_record(&mut reader).await {
            Ok(Some(record)) => dispatch(&inner, &events_tx, record).await,
            Ok(None) => {
                debug!("Management channel closed by peer");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Management channel read error");
                break;
            }
        }
    }

    inner.alive.store(false, Ordering::Release);
    // Dropping the senders wakes every in-flight send_action with a
    // connection error.
    inner.pending.lock().clear();
}

/// Read one blank-line-terminated record. Returns `Ok(None)` on clean EOF.
async fn read_record<R: AsyncRead + Unpin>(
    reader: &mut BufReader<ReadHalf<R>>,
) -> Result<Option<Record>> {
    let mut record = Record::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            if record.is_empty() {
                return Ok(None);
            }
            return Err(RegsyncError::Connection(
                "channel closed mid-record".to_string(),
            ));
        }

        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            if record.is_empty() {
                // Stray blank line between records; keep reading.
                continue;
            }
            return Ok(Some(record));
        }

        match line.split_once(':') {
            Some((key, value)) => {
                record.push((key.trim().to_string(), value.trim().to_string()));
            }
            None => {
                // Continuation or free-form output; not part of the
                // key/value surface this engine consumes.
                trace!(line, "Skipping non key/value line");
            }
        }
    }
}

async fn dispatch(inner: &Arc<ClientInner>, events_tx: &mpsc::Sender<AmiEvent>, record: Record) {
    let lookup = |key: &str| {
        record
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    };

    if let Some(status) = lookup("Response") {
        let id = match lookup("ActionID").and_then(|v| v.parse::<u64>().ok()) {
            Some(id) => id,
            None => {
                trace!("Dropping response without usable ActionID");
                return;
            }
        };
        let resp = AmiResponse {
            success: status.eq_ignore_ascii_case("Success"),
            message: lookup("Message").map(str::to_string),
        };
        if let Some(tx) = inner.pending.lock().remove(&id) {
            let _ = tx.send(resp);
        } else {
            trace!(action_id = id, "Dropping response with no pending action");
        }
        return;
    }

    if let Some(name) = lookup("Event") {
        let name = name.to_string();
        let fields: Vec<(String, String)> = record
            .into_iter()
            .filter(|(k, _)| !k.eq_ignore_ascii_case("Event"))
            .collect();
        // A lagging or dropped subscriber must not kill the reader; pending
        // responses still need to be served.
        let _ = events_tx.send(AmiEvent::new(name, fields)).await;
        return;
    }

    trace!("Dropping record that is neither response nor event");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    const TIMEOUT: Duration = Duration::from_millis(500);

    /// Scripted peer half: reads one inbound record, returns its fields.
    async fn read_peer_record<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> Record {
        let mut record = Record::new();
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await.unwrap();
            if n == 0 {
                panic!("peer stream closed early");
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                return record;
            }
            let (k, v) = line.split_once(':').unwrap();
            record.push((k.trim().to_string(), v.trim().to_string()));
        }
    }

    fn field<'a>(record: &'a Record, key: &str) -> &'a str {
        record
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .unwrap_or_else(|| panic!("missing field {}", key))
    }

    async fn write_lines<W: AsyncWrite + Unpin>(writer: &mut W, lines: &[&str]) {
        for line in lines {
            writer.write_all(line.as_bytes()).await.unwrap();
            writer.write_all(b"\r\n").await.unwrap();
        }
        writer.write_all(b"\r\n").await.unwrap();
        writer.flush().await.unwrap();
    }

    /// Peer that accepts the Login action and then hands control to `body`.
    async fn accept_login(
        peer: DuplexStream,
    ) -> (
        BufReader<tokio::io::ReadHalf<DuplexStream>>,
        tokio::io::WriteHalf<DuplexStream>,
    ) {
        let (read_half, mut write_half) = tokio::io::split(peer);
        write_half
            .write_all(b"Asterisk Call Manager/5.0\r\n")
            .await
            .unwrap();
        let mut reader = BufReader::new(read_half);
        let login = read_peer_record(&mut reader).await;
        assert_eq!(field(&login, "Action"), "Login");
        let id = field(&login, "ActionID").to_string();
        write_lines(
            &mut write_half,
            &[
                "Response: Success",
                &format!("ActionID: {}", id),
                "Message: Authentication accepted",
            ],
        )
        .await;
        (reader, write_half)
    }

    #[tokio::test]
    async fn test_handshake_and_login() {
        let (local, peer) = tokio::io::duplex(4096);
        let server = tokio::spawn(accept_login(peer));

        let (client, _events) = AmiClient::handshake(local, "admin", "secret", TIMEOUT)
            .await
            .expect("handshake should succeed");
        assert!(client.is_alive());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let (local, peer) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let (read_half, mut write_half) = tokio::io::split(peer);
            write_half
                .write_all(b"Asterisk Call Manager/5.0\r\n")
                .await
                .unwrap();
            let mut reader = BufReader::new(read_half);
            let login = read_peer_record(&mut reader).await;
            let id = field(&login, "ActionID").to_string();
            write_lines(
                &mut write_half,
                &[
                    "Response: Error",
                    &format!("ActionID: {}", id),
                    "Message: Authentication failed",
                ],
            )
            .await;
        });

        let err = match AmiClient::handshake(local, "admin", "wrong", TIMEOUT).await {
            Ok(_) => panic!("login must fail"),
            Err(e) => e,
        };
        assert!(err.is_connection_loss());
        assert!(err.to_string().contains("Authentication failed"));
    }

    #[tokio::test]
    async fn test_handshake_rejects_foreign_banner() {
        let (local, peer) = tokio::io::duplex(4096);
        let server = tokio::spawn(async move {
            let (_read_half, mut write_half) = tokio::io::split(peer);
            write_half
                .write_all(b"HTTP/1.1 400 Bad Request\r\n")
                .await
                .unwrap();
        });

        let err = match AmiClient::handshake(local, "admin", "secret", TIMEOUT).await {
            Ok(_) => panic!("handshake must fail on a non-AMI peer"),
            Err(e) => e,
        };
        assert!(matches!(err, RegsyncError::Protocol(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_over_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            write_half
                .write_all(b"Asterisk Call Manager/5.0\r\n")
                .await
                .unwrap();
            let mut reader = BufReader::new(read_half);
            let login = read_peer_record(&mut reader).await;
            assert_eq!(field(&login, "Action"), "Login");
            let id = field(&login, "ActionID").to_string();
            write_lines(
                &mut write_half,
                &["Response: Success", &format!("ActionID: {}", id)],
            )
            .await;
            // Keep the connection open until the test finishes asserting.
            (reader, write_half)
        });

        let (client, _events) = AmiClient::connect("127.0.0.1", port, "admin", "secret", TIMEOUT)
            .await
            .expect("connect should succeed");
        assert!(client.is_alive());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_action_correlates_response() {
        let (local, peer) = tokio::io::duplex(4096);
        let server = tokio::spawn(async move {
            let (mut reader, mut write_half) = accept_login(peer).await;
            let action = read_peer_record(&mut reader).await;
            assert_eq!(field(&action, "Action"), "PJSIPRegister");
            assert_eq!(field(&action, "Registration"), "genesys_reg_5001");
            let id = field(&action, "ActionID").to_string();
            write_lines(
                &mut write_half,
                &["Response: Success", &format!("ActionID: {}", id)],
            )
            .await;
        });

        let (client, _events) = AmiClient::handshake(local, "admin", "secret", TIMEOUT)
            .await
            .unwrap();
        let resp = client
            .send_action(
                AmiAction::new("PJSIPRegister").field("Registration", "genesys_reg_5001"),
            )
            .await
            .unwrap();
        assert!(resp.success);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let (local, peer) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let (_reader, mut write_half) = accept_login(peer).await;
            write_lines(
                &mut write_half,
                &["Event: PeerStatus", "Peer: PJSIP/5001", "PeerStatus: Registered"],
            )
            .await;
            write_lines(
                &mut write_half,
                &["Event: PeerStatus", "Peer: PJSIP/5002", "PeerStatus: Unregistered"],
            )
            .await;
            // Keep the stream open while the client drains events.
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let (_client, mut events) = AmiClient::handshake(local, "admin", "secret", TIMEOUT)
            .await
            .unwrap();
        let first = events.recv().await.unwrap();
        assert_eq!(first.name, "PeerStatus");
        assert_eq!(first.get("Peer"), Some("PJSIP/5001"));
        let second = events.recv().await.unwrap();
        assert_eq!(second.get("PeerStatus"), Some("Unregistered"));
    }

    #[tokio::test]
    async fn test_action_timeout() {
        let (local, peer) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let (_reader, _write_half) = accept_login(peer).await;
            // Swallow the next action and never respond.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let (client, _events) = AmiClient::handshake(local, "admin", "secret", TIMEOUT)
            .await
            .unwrap();
        let err = client
            .send_action(AmiAction::new("PJSIPRegister").field("Registration", "genesys_reg_5001"))
            .await
            .expect_err("must time out");
        assert!(matches!(err, RegsyncError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_liveness_flips_on_peer_close() {
        let (local, peer) = tokio::io::duplex(4096);
        let server = tokio::spawn(async move {
            let halves = accept_login(peer).await;
            drop(halves);
        });

        let (client, mut events) = AmiClient::handshake(local, "admin", "secret", TIMEOUT)
            .await
            .unwrap();
        server.await.unwrap();
        // Event stream ends when the reader task exits.
        assert!(events.recv().await.is_none());
        assert!(!client.is_alive());

        let err = client
            .send_action(AmiAction::new("Ping"))
            .await
            .expect_err("dead channel must refuse actions");
        assert!(err.is_connection_loss());
    }
}
