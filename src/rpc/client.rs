//! Agent RPC session: connection bootstrap, sequencing and request/reply
//! correlation.
//!
//! A [`RpcClient`] owns one TCP connection. Writes go through a mutex that
//! also owns the sequence counter, so sequence order is wire order. Reads are
//! owned by a single background task (see `dispatch`) that routes each reply
//! to whoever registered its sequence.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use rmpv::Value;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::rpc::codec::{self, RequestFrame};
use crate::rpc::dispatch::{self, Registration, Route};
use crate::rpc::proto::{AuthRequest, Command, HandshakeRequest, ResponseHeader, PROTOCOL_VERSION};
use crate::rpc::transport::{format_addr, Transport, TransportWriter};

/// Loopback address the agent binds its RPC listener to by default.
pub const DEFAULT_RPC_HOST: &str = "127.0.0.1";
/// Default agent RPC port.
pub const DEFAULT_RPC_PORT: u16 = 7373;
/// Environment variable holding `host:port` of the agent RPC listener.
pub const RPC_ADDR_ENV: &str = "SERF_RPC_ADDR";
/// Environment variable holding the RPC auth key.
pub const RPC_AUTH_ENV: &str = "SERF_RPC_AUTH";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RpcClientDefaults;

impl RpcClientDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const SUBSCRIPTION_CAPACITY: usize = 64;
    /// How long `close` waits for the reader to release its subscriptions.
    pub const CLOSE_GRACE: Duration = Duration::from_secs(1);
}

/// Connection parameters for [`RpcClient`].
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    /// Pre-shared key sent with `auth` right after the handshake.
    pub auth_key: Option<SecretString>,
    pub connect_timeout: Option<Duration>,
    /// Deadline applied to every awaited reply, acknowledgement and query
    /// record. `None` waits forever.
    pub read_timeout: Option<Duration>,
    /// Records waiting on one subscription's consumer before the reader
    /// logs a backlog warning. Delivery itself never blocks the reader.
    pub subscription_capacity: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_RPC_HOST.to_string(),
            port: DEFAULT_RPC_PORT,
            auth_key: None,
            connect_timeout: Some(RpcClientDefaults::CONNECT_TIMEOUT),
            read_timeout: None,
            subscription_capacity: RpcClientDefaults::SUBSCRIPTION_CAPACITY,
        }
    }
}

impl ConnectOptions {
    /// Options pointing at the local agent on the default port.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `SERF_RPC_ADDR` and `SERF_RPC_AUTH`, keeping defaults for
    /// whatever is unset.
    pub fn from_env() -> Result<Self, RpcClientError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, RpcClientError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = Self::default();
        if let Some(addr) = lookup(RPC_ADDR_ENV).filter(|value| !value.trim().is_empty()) {
            let (host, port) = parse_addr(addr.trim())?;
            options.host = host;
            options.port = port;
        }
        if let Some(key) = lookup(RPC_AUTH_ENV).filter(|value| !value.is_empty()) {
            options.auth_key = Some(SecretString::new(key));
        }
        Ok(options)
    }

    /// Sets the agent's RPC host and port.
    pub fn with_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Sets the key sent with `auth` during bootstrap.
    pub fn with_auth_key(mut self, auth_key: SecretString) -> Self {
        self.auth_key = Some(auth_key);
        self
    }

    /// Bounds the TCP connect. `None` waits for the OS.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bounds every awaited reply, acknowledgement and query record.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Sets the per-subscription backlog above which the reader warns.
    pub fn with_subscription_capacity(mut self, capacity: usize) -> Self {
        self.subscription_capacity = capacity.max(1);
        self
    }

    /// `host:port`, with IPv6 hosts bracketed.
    pub fn address(&self) -> String {
        format_addr(&self.host, self.port)
    }
}

fn parse_addr(addr: &str) -> Result<(String, u16), RpcClientError> {
    let invalid = || RpcClientError::Protocol(format!("invalid rpc address {addr:?}"));
    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

/// Lifecycle of one RPC session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// Connected, nothing sent yet. Only `handshake` is allowed.
    Fresh,
    /// Handshake accepted. `auth` must come next when a key is configured.
    Handshaken,
    /// Auth accepted.
    Authenticated,
    /// Bootstrap finished; any command may be issued.
    Ready,
    Closed,
}

impl SessionState {
    /// Checks whether `command` may be sent now and returns the state the
    /// session moves to once it is sent.
    pub(crate) fn admit(self, command: Command, auth_required: bool) -> Result<Self, RpcClientError> {
        match (self, command) {
            (SessionState::Closed, _) => Err(RpcClientError::ConnectionClosed),
            (SessionState::Fresh, Command::Handshake) => Ok(self),
            (_, Command::Handshake) => Err(RpcClientError::Protocol(
                "handshake already completed on this session".to_string(),
            )),
            (SessionState::Handshaken, Command::Auth) => Ok(self),
            (SessionState::Fresh, Command::Auth) => Err(RpcClientError::Protocol(
                "auth issued before handshake".to_string(),
            )),
            (_, Command::Auth) => Err(RpcClientError::Protocol(
                "auth must immediately follow the handshake".to_string(),
            )),
            (SessionState::Fresh, command) => Err(RpcClientError::Protocol(format!(
                "handshake required before {command}"
            ))),
            (SessionState::Handshaken, command) if auth_required => Err(
                RpcClientError::Protocol(format!("auth required before {command}")),
            ),
            (SessionState::Handshaken | SessionState::Authenticated, _) => Ok(SessionState::Ready),
            (SessionState::Ready, _) => Ok(SessionState::Ready),
        }
    }
}

/// Errors produced by the RPC engine.
#[derive(Debug, Error)]
pub enum RpcClientError {
    /// The TCP connection could not be established.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Socket read or write failure on an established connection.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A request body could not be serialized.
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Bytes from the agent could not be decoded into the expected message.
    #[error("decode error: {0}")]
    Decode(String),

    /// Session misuse or an agent reply that breaks the protocol contract.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The agent answered with a non-empty error field.
    #[error("rpc error: {0}")]
    Rpc(String),

    /// No reply within the configured read deadline.
    #[error("timed out after {0:?} waiting for the agent")]
    Timeout(Duration),

    /// The session is closed or the connection went away.
    #[error("connection closed")]
    ConnectionClosed,
}

impl RpcClientError {
    /// Copy of this error for delivery to one more waiter.
    pub(crate) fn for_waiter(&self) -> Self {
        match self {
            Self::Connect { addr, source } => Self::Connect {
                addr: addr.clone(),
                source: io::Error::new(source.kind(), source.to_string()),
            },
            Self::Io(err) => Self::Io(io::Error::new(err.kind(), err.to_string())),
            Self::Encode(err) => Self::Decode(err.to_string()),
            Self::Decode(message) => Self::Decode(message.clone()),
            Self::Protocol(message) => Self::Protocol(message.clone()),
            Self::Rpc(message) => Self::Rpc(message.clone()),
            Self::Timeout(limit) => Self::Timeout(*limit),
            Self::ConnectionClosed => Self::ConnectionClosed,
        }
    }
}

/// A successful reply: header plus the body for commands that carry one.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub header: ResponseHeader,
    pub body: Option<Value>,
}

impl Response {
    pub(crate) fn new(header: ResponseHeader, body: Option<Value>) -> Self {
        Self { header, body }
    }

    /// Sequence the reply was correlated on.
    pub fn seq(&self) -> u64 {
        self.header.seq
    }

    /// Decodes the body into `T`.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T, RpcClientError> {
        match &self.body {
            Some(body) => codec::from_value(body.clone()),
            None => Err(RpcClientError::Decode(format!(
                "reply to sequence {} has no body",
                self.header.seq
            ))),
        }
    }
}

#[derive(Debug)]
struct WriterState {
    transport: TransportWriter,
    last_seq: u64,
}

#[derive(Debug)]
struct ClientInner {
    writer: Mutex<WriterState>,
    registrations: mpsc::UnboundedSender<Registration>,
    state: Arc<watch::Sender<SessionState>>,
    options: ConnectOptions,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(reader) = self.reader_task.get_mut().take() {
            reader.abort();
        }
    }
}

/// Handle to one agent RPC session. Cheap to clone; all clones share the
/// connection.
#[derive(Clone, Debug)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    /// Connects, performs the handshake and, when a key is configured, auth.
    pub async fn connect(options: ConnectOptions) -> Result<Self, RpcClientError> {
        let client = Self::open(options).await?;
        if let Err(err) = client.bootstrap().await {
            client.close().await;
            return Err(err);
        }
        Ok(client)
    }

    /// Opens the connection without sending anything. The session starts in
    /// [`SessionState::Fresh`] and the caller drives `handshake`/`auth`.
    pub async fn open(options: ConnectOptions) -> Result<Self, RpcClientError> {
        let connect = Transport::connect(&options.host, options.port);
        let (reader, writer) = match options.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
                RpcClientError::Connect {
                    addr: options.address(),
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                }
            })??,
            None => connect.await?,
        };

        let (registrations_tx, registrations_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SessionState::Fresh);
        let state = Arc::new(state_tx);
        let reader_task = tokio::spawn(dispatch::run_reader(
            reader,
            registrations_rx,
            Arc::clone(&state),
        ));

        info!(event = "rpc_session_opened", addr = %options.address());
        Ok(Self {
            inner: Arc::new(ClientInner {
                writer: Mutex::new(WriterState {
                    transport: writer,
                    last_seq: 0,
                }),
                registrations: registrations_tx,
                state,
                options,
                reader_task: Mutex::new(Some(reader_task)),
            }),
        })
    }

    async fn bootstrap(&self) -> Result<(), RpcClientError> {
        self.handshake(PROTOCOL_VERSION).await?;
        if let Some(key) = self.inner.options.auth_key.clone() {
            self.auth(&key).await?;
        }
        self.inner.state.send_if_modified(|state| {
            let ready = matches!(state, SessionState::Handshaken | SessionState::Authenticated);
            if ready {
                *state = SessionState::Ready;
            }
            ready
        });
        Ok(())
    }

    /// Sends `handshake`. Must be the first command on the connection.
    pub async fn handshake(&self, version: u32) -> Result<Response, RpcClientError> {
        let response = self
            .request(Command::Handshake, Some(&HandshakeRequest { version }))
            .await
            .map_err(rejected)?;
        self.advance(SessionState::Fresh, SessionState::Handshaken);
        info!(event = "rpc_handshake_complete", version, seq = response.seq());
        Ok(response)
    }

    /// Sends `auth`. Must directly follow the handshake.
    pub async fn auth(&self, key: &SecretString) -> Result<Response, RpcClientError> {
        let body = AuthRequest {
            auth_key: key.expose_secret().clone(),
        };
        let response = self
            .request(Command::Auth, Some(&body))
            .await
            .map_err(rejected)?;
        self.advance(SessionState::Handshaken, SessionState::Authenticated);
        info!(event = "rpc_auth_complete", seq = response.seq());
        Ok(response)
    }

    /// Sends a non-streaming command and waits for its reply.
    ///
    /// `body` must be present exactly for the commands that take one. A
    /// non-empty error from the agent is returned as [`RpcClientError::Rpc`].
    pub async fn request<B>(
        &self,
        command: Command,
        body: Option<&B>,
    ) -> Result<Response, RpcClientError>
    where
        B: Serialize + ?Sized,
    {
        if command.is_streaming() || command == Command::Stop {
            return Err(RpcClientError::Protocol(format!(
                "{command} must be issued through its subscription api"
            )));
        }
        if body.is_some() != command.request_has_body() {
            return Err(RpcClientError::Protocol(if body.is_some() {
                format!("{command} does not take a request body")
            } else {
                format!("{command} requires a request body")
            }));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(command, body, Route::Reply {
            command,
            reply: reply_tx,
        })
        .await?;
        self.await_reply(reply_rx).await
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Options the session was opened with.
    pub fn options(&self) -> &ConnectOptions {
        &self.inner.options
    }

    /// Closes the session. Idempotent, and a no-op beyond releasing the
    /// socket when the handshake never happened.
    ///
    /// Pending requests fail with `ConnectionClosed`. Live subscriptions
    /// receive `ConnectionClosed` as their last record and end `Stopped`.
    pub async fn close(&self) {
        let previous = self.inner.state.send_replace(SessionState::Closed);
        self.inner.writer.lock().await.transport.close().await;
        let reader = self.inner.reader_task.lock().await.take();
        if let Some(mut reader) = reader {
            if tokio::time::timeout(RpcClientDefaults::CLOSE_GRACE, &mut reader)
                .await
                .is_err()
            {
                warn!(event = "rpc_reader_abandoned");
                reader.abort();
            }
        }
        if previous != SessionState::Closed {
            info!(event = "rpc_session_closed", previous = ?previous);
        }
    }

    /// Encodes, sequences, registers the reply route and writes one command.
    pub(crate) async fn send_command<B>(
        &self,
        command: Command,
        body: Option<&B>,
        route: Route,
    ) -> Result<u64, RpcClientError>
    where
        B: Serialize + ?Sized,
    {
        let frame = RequestFrame::new(command, body)?;

        let mut writer = self.inner.writer.lock().await;
        self.admit(command)?;
        let seq = writer.last_seq + 1;
        let bytes = frame.into_bytes(seq)?;

        self.inner
            .registrations
            .send(Registration { seq, route })
            .map_err(|_| RpcClientError::ConnectionClosed)?;
        writer.last_seq = seq;

        match writer.transport.send(&bytes).await {
            Ok(written) => {
                debug!(event = "rpc_request_sent", seq, command = %command, bytes = written);
                Ok(seq)
            }
            Err(err) => {
                warn!(event = "rpc_request_write_failed", seq, command = %command, error = %err);
                self.inner.state.send_replace(SessionState::Closed);
                Err(err)
            }
        }
    }

    /// Waits for a routed reply, honouring the read deadline.
    pub(crate) async fn await_reply<T>(
        &self,
        reply: oneshot::Receiver<Result<T, RpcClientError>>,
    ) -> Result<T, RpcClientError> {
        let outcome = match self.inner.options.read_timeout {
            Some(limit) => tokio::time::timeout(limit, reply)
                .await
                .map_err(|_| RpcClientError::Timeout(limit))?,
            None => reply.await,
        };
        outcome.map_err(|_| RpcClientError::ConnectionClosed)?
    }

    pub(crate) fn read_timeout(&self) -> Option<Duration> {
        self.inner.options.read_timeout
    }

    pub(crate) fn subscription_capacity(&self) -> usize {
        self.inner.options.subscription_capacity.max(1)
    }

    fn admit(&self, command: Command) -> Result<(), RpcClientError> {
        let auth_required = self.inner.options.auth_key.is_some();
        let mut outcome = Ok(());
        self.inner.state.send_if_modified(|state| match state.admit(command, auth_required) {
            Ok(next) => {
                let changed = next != *state;
                *state = next;
                changed
            }
            Err(err) => {
                outcome = Err(err);
                false
            }
        });
        outcome
    }

    fn advance(&self, from: SessionState, to: SessionState) {
        self.inner.state.send_if_modified(|state| {
            let matches = *state == from;
            if matches {
                *state = to;
            }
            matches
        });
    }
}

/// Bootstrap rejections are protocol failures, not ordinary command errors.
fn rejected(err: RpcClientError) -> RpcClientError {
    match err {
        RpcClientError::Rpc(message) => RpcClientError::Protocol(message),
        other => other,
    }
}
