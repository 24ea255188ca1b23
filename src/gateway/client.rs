//! Gateway websocket client and session engine.
//!
//! [`GatewayClient::connect`] spawns a single worker task that owns the
//! websocket, the [`Session`], the heartbeat timer and the reconnect timer.
//! Callers talk to the worker through a cloneable [`GatewaySender`] and read
//! [`GatewayEvent`]s from an unbounded channel.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::gateway::heartbeat::{HeartbeatScheduler, HeartbeatTick};
use crate::gateway::proto::{
    classify_close_code, gateway_url, CloseDisposition, ConnectionPropertiesMsg, Encoding,
    Envelope, HelloMsg, IdentifyMsg, Opcode, ReadyMsg, GATEWAY_VERSION,
};
use crate::gateway::reconnect::{ReconnectSupervisor, Schedule};
use crate::gateway::session::{ConnectionState, Session};
use crate::retry::{with_timeout, RetryPolicy};

/// Production gateway endpoint.
pub const GATEWAY_ENDPOINT: &str = "wss://gateway.discord.gg";

/// Close code used when the client drops a socket but wants to resume.
const RESUMABLE_CLOSE_CODE: u16 = 4000;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GatewayDefaults;

impl GatewayDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const HELLO_TIMEOUT: Duration = Duration::from_secs(20);
    pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);
    /// Bound on flushing a close frame to a socket that may be stalled.
    pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Handshake and pacing settings for a gateway session.
#[derive(Clone, Debug)]
pub struct GatewayOptions {
    /// Event subscription bitmask sent with Identify.
    pub intents: u64,
    pub properties: ConnectionPropertiesMsg,
    /// Initial presence sent with Identify, already validated by the caller.
    pub presence: Option<Value>,
    pub connect_timeout: Duration,
    /// How long a fresh socket may stay silent before Hello arrives.
    pub hello_timeout: Duration,
    pub reconnect_policy: RetryPolicy,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            intents: 0,
            properties: ConnectionPropertiesMsg::default(),
            presence: None,
            connect_timeout: GatewayDefaults::CONNECT_TIMEOUT,
            hello_timeout: GatewayDefaults::HELLO_TIMEOUT,
            reconnect_policy: RetryPolicy::constant(GatewayDefaults::RECONNECT_DELAY),
        }
    }
}

/// Entry point for opening gateway sessions.
#[derive(Clone)]
pub struct GatewayClient {
    token: SecretString,
    endpoint: String,
    options: GatewayOptions,
}

impl GatewayClient {
    pub fn new(token: SecretString) -> Self {
        Self::with_options(token, GatewayOptions::default())
    }

    pub fn with_options(token: SecretString, options: GatewayOptions) -> Self {
        Self {
            token,
            endpoint: GATEWAY_ENDPOINT.to_string(),
            options,
        }
    }

    /// Sets an explicit gateway endpoint, without query parameters.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint = endpoint.trim_end().to_string();
        self
    }

    pub fn with_intents(mut self, intents: u64) -> Self {
        self.options.intents = intents;
        self
    }

    /// Opens a gateway session.
    ///
    /// This spawns the session worker and resolves once the first websocket
    /// is open. Failures after that point are recovered by the worker and
    /// reported as events.
    pub async fn connect(&self) -> Result<GatewayConnection, GatewayError> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (ready_tx, ready_rx) = oneshot::channel();

        let engine = SessionEngine {
            token: self.token.clone(),
            endpoint: self.endpoint.clone(),
            identify_options: self.options.clone(),
            session: Session::new(),
            heartbeat: HeartbeatScheduler::new(),
            supervisor: ReconnectSupervisor::new(self.options.reconnect_policy.clone()),
            commands: command_rx,
            events: event_tx,
            state: state_tx,
        };
        tokio::spawn(engine.run(ready_tx));

        match ready_rx.await {
            Ok(Ok(())) => Ok(GatewayConnection {
                sender: GatewaySender {
                    tx: command_tx,
                    state: state_rx,
                },
                events: event_rx,
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(GatewayError::Protocol(
                "gateway worker stopped before initial connect".to_string(),
            )),
        }
    }
}

/// Notifications produced by the session worker.
#[derive(Debug)]
pub enum GatewayEvent {
    /// A websocket was opened.
    Open,
    Hello { heartbeat_interval: Duration },
    /// An ordinary gateway event.
    Dispatch {
        name: String,
        sequence: Option<u64>,
        data: Value,
    },
    /// The server discarded the session; the next handshake identifies.
    InvalidSession { resumable: bool },
    Reconnecting { resume: bool, delay: Duration },
    Close { code: Option<u16>, reason: String },
    Error(GatewayError),
}

/// Active gateway session handles.
#[derive(Debug)]
pub struct GatewayConnection {
    sender: GatewaySender,
    events: mpsc::UnboundedReceiver<GatewayEvent>,
}

impl GatewayConnection {
    pub fn sender(&self) -> GatewaySender {
        self.sender.clone()
    }

    pub fn split(self) -> (GatewaySender, mpsc::UnboundedReceiver<GatewayEvent>) {
        (self.sender, self.events)
    }

    /// Receives the next event. Returns `None` once the worker has exited.
    pub async fn recv(&mut self) -> Option<GatewayEvent> {
        self.events.recv().await
    }
}

enum Command {
    Send(Envelope),
    Close,
}

/// Cloneable handle for writing frames to the live socket.
#[derive(Clone, Debug)]
pub struct GatewaySender {
    tx: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Send(envelope) => f.debug_tuple("Send").field(&envelope.opcode).finish(),
            Command::Close => f.write_str("Close"),
        }
    }
}

impl GatewaySender {
    /// Writes one frame. Fails with [`GatewayError::NotConnected`] instead of
    /// buffering when no socket is open.
    pub fn send(&self, opcode: Opcode, data: Value) -> Result<(), GatewayError> {
        if !self.state().is_socket_open() {
            return Err(GatewayError::NotConnected);
        }
        self.tx
            .send(Command::Send(Envelope::new(opcode, data)))
            .map_err(|_| GatewayError::SendQueueClosed)
    }

    pub fn update_presence(&self, presence: Value) -> Result<(), GatewayError> {
        self.send(Opcode::PresenceUpdate, presence)
    }

    pub fn update_voice_state(&self, voice_state: Value) -> Result<(), GatewayError> {
        self.send(Opcode::VoiceStateUpdate, voice_state)
    }

    pub fn request_guild_members(&self, request: Value) -> Result<(), GatewayError> {
        self.send(Opcode::RequestGuildMembers, request)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Tears the session down: closes the socket and cancels every timer.
    pub fn close(&self) -> Result<(), GatewayError> {
        self.tx
            .send(Command::Close)
            .map_err(|_| GatewayError::SendQueueClosed)
    }

    /// Returns `true` once the worker has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Errors produced by gateway transport and protocol handling.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// No socket is open to write to.
    #[error("gateway is not connected")]
    NotConnected,

    #[error("send queue is closed")]
    SendQueueClosed,

    #[error("timed out opening gateway socket")]
    ConnectTimeout,

    /// The server sent a frame the codec could not decode.
    #[error("malformed gateway frame: {0}")]
    Decode(String),

    /// The server rejected this client; the session will not reconnect.
    #[error("gateway closed with fatal code {code}: {reason}")]
    FatalClose { code: u16, reason: String },

    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: usize },

    #[error("protocol error: {0}")]
    Protocol(String),
}

enum SessionOutcome {
    Shutdown,
    Reconnect { resume: bool },
    Fatal(GatewayError),
}

struct SessionEngine {
    token: SecretString,
    endpoint: String,
    identify_options: GatewayOptions,
    session: Session,
    heartbeat: HeartbeatScheduler,
    supervisor: ReconnectSupervisor,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<GatewayEvent>,
    state: watch::Sender<ConnectionState>,
}

impl SessionEngine {
    async fn run(mut self, ready_tx: oneshot::Sender<Result<(), GatewayError>>) {
        let mut ready_tx = Some(ready_tx);

        loop {
            let outcome = match self.open_socket().await {
                Ok(socket) => {
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(Ok(()));
                    }
                    self.drive(socket).await
                }
                Err(err) => {
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(Err(err));
                        self.shutdown();
                        return;
                    }
                    warn!(event = "gateway_connect_failed", error = %err);
                    self.emit(GatewayEvent::Error(err));
                    SessionOutcome::Reconnect {
                        resume: self.session.can_resume(),
                    }
                }
            };

            self.heartbeat.stop();
            self.session.disconnected();
            self.publish_state();

            match outcome {
                SessionOutcome::Shutdown => break,
                SessionOutcome::Fatal(err) => {
                    warn!(event = "gateway_fatal", error = %err);
                    self.emit(GatewayEvent::Error(err));
                    break;
                }
                SessionOutcome::Reconnect { resume } => {
                    if !self.await_reconnect(resume).await {
                        break;
                    }
                }
            }
        }

        self.shutdown();
    }

    async fn open_socket(&mut self) -> Result<WsStream, GatewayError> {
        self.session.begin_connect();
        self.publish_state();

        let base = match self.session.resume_url() {
            Some(resume_url) if self.session.can_resume() => resume_url,
            _ => self.endpoint.as_str(),
        };
        let url = gateway_url(base, GATEWAY_VERSION, Encoding::Json, false);
        debug!(event = "gateway_connecting", url = %url);

        let (socket, _) = with_timeout(
            self.identify_options.connect_timeout,
            connect_async(url.as_str()),
        )
        .await
        .map_err(|_| GatewayError::ConnectTimeout)??;

        self.session.socket_opened();
        self.publish_state();
        self.emit(GatewayEvent::Open);
        Ok(socket)
    }

    async fn drive(&mut self, mut socket: WsStream) -> SessionOutcome {
        let hello_deadline = tokio::time::sleep(self.identify_options.hello_timeout);
        tokio::pin!(hello_deadline);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Send(envelope)) => {
                        if let Err(err) = send_envelope(&mut socket, &envelope).await {
                            return self.transport_lost(err);
                        }
                    }
                    Some(Command::Close) | None => {
                        close_socket(&mut socket, 1000, "client closed").await;
                        self.emit(GatewayEvent::Close {
                            code: Some(1000),
                            reason: "client closed".to_string(),
                        });
                        return SessionOutcome::Shutdown;
                    }
                },
                tick = self.heartbeat.tick() => match tick {
                    HeartbeatTick::Send => {
                        self.session.set_heartbeat_acked(false);
                        let heartbeat = Envelope::heartbeat(self.session.sequence());
                        if let Err(err) = send_envelope(&mut socket, &heartbeat).await {
                            return self.transport_lost(err);
                        }
                    }
                    HeartbeatTick::Missed => {
                        warn!(event = "heartbeat_ack_missed");
                        self.drop_socket(&mut socket, "heartbeat ack missed").await;
                        return SessionOutcome::Reconnect { resume: true };
                    }
                },
                _ = &mut hello_deadline, if self.session.state() == ConnectionState::AwaitingHello => {
                    warn!(event = "hello_timeout");
                    self.drop_socket(&mut socket, "hello timeout").await;
                    return SessionOutcome::Reconnect {
                        resume: self.session.can_resume(),
                    };
                }
                inbound = socket.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(outcome) = self.handle_text(&mut socket, &text).await {
                            return outcome;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        self.emit(GatewayEvent::Error(GatewayError::Decode(
                            "binary frame on a json session".to_string(),
                        )));
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(err) = socket.send(Message::Pong(payload)).await {
                            return self.transport_lost(err.into());
                        }
                    }
                    Some(Ok(Message::Close(frame))) => return self.closed_by_server(frame),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return self.transport_lost(err.into()),
                    None => return self.closed_by_server(None),
                }
            }
        }
    }

    async fn handle_text(&mut self, socket: &mut WsStream, text: &str) -> Option<SessionOutcome> {
        let envelope = match Envelope::from_text(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(event = "gateway_frame_malformed", error = %err);
                self.emit(GatewayEvent::Error(GatewayError::Decode(err.to_string())));
                return None;
            }
        };

        match envelope.opcode {
            Opcode::Hello => self.on_hello(socket, envelope.data).await,
            Opcode::Dispatch => {
                self.on_dispatch(envelope);
                None
            }
            Opcode::Heartbeat => {
                debug!(event = "heartbeat_requested");
                let heartbeat = Envelope::heartbeat(self.session.sequence());
                match send_envelope(socket, &heartbeat).await {
                    Ok(()) => None,
                    Err(err) => Some(self.transport_lost(err)),
                }
            }
            Opcode::HeartbeatAck => {
                self.heartbeat.on_ack();
                self.session.set_heartbeat_acked(true);
                None
            }
            Opcode::Reconnect => {
                info!(event = "reconnect_requested");
                self.drop_socket(socket, "reconnect requested").await;
                Some(SessionOutcome::Reconnect { resume: true })
            }
            Opcode::InvalidSession => {
                let resumable = envelope.data.as_bool().unwrap_or(false);
                info!(event = "session_invalidated", resumable);
                self.session.invalidate(resumable);
                self.emit(GatewayEvent::InvalidSession { resumable });
                self.drop_socket(socket, "invalid session").await;
                Some(SessionOutcome::Reconnect { resume: false })
            }
            Opcode::Identify
            | Opcode::PresenceUpdate
            | Opcode::VoiceStateUpdate
            | Opcode::Resume
            | Opcode::RequestGuildMembers => {
                warn!(event = "unexpected_inbound_opcode", op = envelope.opcode.code());
                None
            }
        }
    }

    async fn on_hello(&mut self, socket: &mut WsStream, data: Value) -> Option<SessionOutcome> {
        let hello = match serde_json::from_value::<HelloMsg>(data) {
            Ok(hello) if hello.heartbeat_interval > 0 => hello,
            Ok(_) => {
                return Some(self.malformed_hello("heartbeat_interval must be > 0".to_string()))
            }
            Err(err) => return Some(self.malformed_hello(err.to_string())),
        };

        let interval = Duration::from_millis(hello.heartbeat_interval);
        self.session.hello(interval);
        self.supervisor.reset_attempts();
        self.heartbeat.start(interval);
        self.emit(GatewayEvent::Hello {
            heartbeat_interval: interval,
        });

        let handshake = match self.handshake_envelope() {
            Ok(envelope) => envelope,
            Err(err) => return Some(SessionOutcome::Fatal(err)),
        };
        info!(
            event = "gateway_handshake",
            resume = handshake.opcode == Opcode::Resume
        );
        self.session.authenticating();
        self.publish_state();

        match send_envelope(socket, &handshake).await {
            Ok(()) => None,
            Err(err) => Some(self.transport_lost(err)),
        }
    }

    fn malformed_hello(&mut self, detail: String) -> SessionOutcome {
        warn!(event = "gateway_hello_malformed", detail = %detail);
        self.emit(GatewayEvent::Error(GatewayError::Decode(detail)));
        SessionOutcome::Reconnect {
            resume: self.session.can_resume(),
        }
    }

    fn handshake_envelope(&mut self) -> Result<Envelope, GatewayError> {
        let token = self.token.expose_secret();
        if let Some(resume) = self.session.resume_msg(token) {
            return Ok(Envelope::new(Opcode::Resume, serde_json::to_value(resume)?));
        }

        // A fresh Identify starts a new sequence; leftovers would mark its
        // dispatches as stale.
        self.session.discard_continuity();

        let identify = IdentifyMsg {
            token: token.to_string(),
            intents: self.identify_options.intents,
            properties: self.identify_options.properties.clone(),
            presence: self.identify_options.presence.clone(),
        };
        Ok(Envelope::new(Opcode::Identify, serde_json::to_value(identify)?))
    }

    fn on_dispatch(&mut self, envelope: Envelope) {
        let Envelope {
            data,
            sequence,
            event_name,
            ..
        } = envelope;

        if let Some(sequence) = sequence {
            if !self.session.record_sequence(sequence) {
                debug!(event = "stale_sequence", sequence);
            }
        }

        let name = event_name.unwrap_or_default();
        if name == "READY" {
            match serde_json::from_value::<ReadyMsg>(data.clone()) {
                Ok(ready) => {
                    info!(event = "session_ready", session_id = %ready.session_id);
                    self.session.ready(ready.session_id, ready.resume_gateway_url);
                }
                Err(err) => {
                    warn!(event = "ready_malformed", error = %err);
                    self.emit(GatewayEvent::Error(GatewayError::Decode(err.to_string())));
                    self.session.connected();
                }
            }
        } else {
            if name == "RESUMED" {
                info!(event = "session_resumed");
            }
            self.session.connected();
        }
        self.publish_state();

        self.emit(GatewayEvent::Dispatch {
            name,
            sequence,
            data,
        });
    }

    fn closed_by_server(&mut self, frame: Option<CloseFrame<'static>>) -> SessionOutcome {
        let code = frame.as_ref().map(|frame| u16::from(frame.code));
        let reason = frame
            .map(|frame| frame.reason.into_owned())
            .unwrap_or_default();
        info!(event = "gateway_closed", code = ?code, reason = %reason);
        self.emit(GatewayEvent::Close {
            code,
            reason: reason.clone(),
        });

        match classify_close_code(code) {
            CloseDisposition::Fatal => SessionOutcome::Fatal(GatewayError::FatalClose {
                code: code.unwrap_or_default(),
                reason,
            }),
            CloseDisposition::Reidentify => SessionOutcome::Reconnect { resume: false },
            CloseDisposition::Resume => SessionOutcome::Reconnect {
                resume: self.session.can_resume(),
            },
        }
    }

    fn transport_lost(&mut self, err: GatewayError) -> SessionOutcome {
        warn!(event = "gateway_transport_lost", error = %err);
        self.emit(GatewayEvent::Close {
            code: None,
            reason: err.to_string(),
        });
        self.emit(GatewayEvent::Error(err));
        SessionOutcome::Reconnect {
            resume: self.session.can_resume(),
        }
    }

    /// Closes the socket with a non-normal code so the session stays resumable.
    async fn drop_socket(&mut self, socket: &mut WsStream, reason: &str) {
        close_socket(socket, RESUMABLE_CLOSE_CODE, reason).await;
        self.emit(GatewayEvent::Close {
            code: Some(RESUMABLE_CLOSE_CODE),
            reason: reason.to_string(),
        });
    }

    /// Waits out the reconnect delay. Returns `false` when the engine should
    /// stop instead of reconnecting.
    async fn await_reconnect(&mut self, resume: bool) -> bool {
        if !resume {
            self.session.discard_continuity();
        }

        match self.supervisor.schedule(resume) {
            Schedule::Scheduled { delay } => {
                self.emit(GatewayEvent::Reconnecting { resume, delay });
            }
            Schedule::AlreadyPending => {}
            Schedule::Exhausted { attempts } => {
                warn!(event = "reconnect_exhausted", attempts);
                self.emit(GatewayEvent::Error(GatewayError::ReconnectExhausted {
                    attempts,
                }));
                return false;
            }
        }

        loop {
            tokio::select! {
                resume_eligible = self.supervisor.wait() => {
                    if !resume_eligible {
                        self.session.discard_continuity();
                    }
                    return true;
                }
                command = self.commands.recv() => match command {
                    Some(Command::Send(envelope)) => {
                        debug!(
                            event = "send_dropped_while_disconnected",
                            op = envelope.opcode.code()
                        );
                    }
                    Some(Command::Close) | None => {
                        self.supervisor.cancel();
                        return false;
                    }
                },
            }
        }
    }

    fn shutdown(&mut self) {
        self.heartbeat.stop();
        self.supervisor.cancel();
        self.session.reset();
        self.publish_state();
        debug!(event = "gateway_worker_stopped");
    }

    fn emit(&self, event: GatewayEvent) {
        let _ = self.events.send(event);
    }

    fn publish_state(&self) {
        self.state.send_replace(self.session.state());
    }
}

async fn close_socket(socket: &mut WsStream, code: u16, reason: &str) {
    let closed = with_timeout(
        GatewayDefaults::CLOSE_TIMEOUT,
        socket.close(Some(close_frame(code, reason))),
    )
    .await;
    if closed.is_err() {
        debug!(event = "gateway_close_timed_out", code);
    }
}

fn close_frame(code: u16, reason: &str) -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    }
}

async fn send_envelope(socket: &mut WsStream, envelope: &Envelope) -> Result<(), GatewayError> {
    let text = envelope.to_text()?;
    socket.send(Message::Text(text)).await?;
    Ok(())
}
