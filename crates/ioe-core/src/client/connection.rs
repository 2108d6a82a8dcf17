use crate::api::{DeviceInfo, EventRecord, LoginRequest, ReplyEnvelope, parse_event_list};
use crate::client::correlator::Correlator;
use crate::client::events::EventBuffer;
use crate::client::identity::{SnCheck, reconcile_sn};
use crate::client::reconnect::ReconnectTimer;
use crate::client::types::{ConnectionEvent, ConnectionEventKind, ConnectionStatus, SnDecision};
use crate::config::{ConnectionOptions, Credentials, DeviceConfig};
use crate::error::{ClientError, Result};
use crate::wire::{self, CODE_EVENT_LIST, CODE_LOGIN, Inbound, WireMessage};

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite;

/// Device pushes queued for the listener beyond this are dropped. Status and
/// handshake events are never dropped.
pub const PUSH_BACKLOG: usize = 1024;

/// Per-socket state. Everything here is reset when a socket goes away.
struct Session {
    status: ConnectionStatus,
    /// Bumped for every socket; stale tasks compare against it.
    generation: u64,
    /// Generation of the socket currently connecting or open.
    live: Option<u64>,
    task: Option<AbortHandle>,
    /// Writer queue of the open socket.
    outbound: Option<async_channel::Sender<String>>,
    /// Login accepted on the current socket.
    connected: bool,
    /// Login accepted, event history not merged yet.
    backfilling: bool,
    /// Live events that arrived while backfilling.
    staged: Vec<EventRecord>,
    device_sn: Option<String>,
    beta: bool,
    /// Remote serial waiting for `resolve_sn_conflict`.
    sn_conflict: Option<String>,
}

impl Session {
    fn new() -> Self {
        Self {
            status: ConnectionStatus::Idle,
            generation: 0,
            live: None,
            task: None,
            outbound: None,
            connected: false,
            backfilling: false,
            staged: Vec::new(),
            device_sn: None,
            beta: false,
            sn_conflict: None,
        }
    }
}

// Lock order: reconnect, session, correlator, events. No lock is held
// across an await.
struct Inner {
    name: String,
    addr: String,
    config: Mutex<DeviceConfig>,
    credentials: Credentials,
    options: ConnectionOptions,
    runtime: tokio::runtime::Handle,
    /// Drained in order into the listener channel by `forward_events`.
    event_queue: async_channel::Sender<ConnectionEvent>,
    session: Mutex<Session>,
    correlator: Mutex<Correlator>,
    events: Mutex<EventBuffer>,
    reconnect: Mutex<ReconnectTimer>,
}

/// A single device connection: socket lifecycle, handshake, request
/// correlation and push routing.
///
/// Cheap to clone; all clones drive the same socket. Everything the
/// connection observes is reported on the `event_tx` channel given at
/// construction. The socket is re-opened on its own after any close until
/// `close()` is called or the last clone is dropped.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
    _owner: Arc<Owner>,
}

/// Shared by the caller's clones only; the session tasks hold `Inner`
/// directly, so this goes away with the last caller handle.
struct Owner {
    inner: Weak<Inner>,
}

impl Drop for Owner {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            if !inner.reconnect.lock().is_closing() {
                log::debug!("Last handle to {} dropped, closing", inner.addr);
                inner.close();
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.name)
            .field("addr", &self.inner.addr)
            .field("status", &self.status())
            .finish()
    }
}

impl Connection {
    pub fn new(
        config: DeviceConfig,
        credentials: Credentials,
        options: ConnectionOptions,
        runtime: tokio::runtime::Handle,
        event_tx: async_channel::Sender<ConnectionEvent>,
    ) -> Self {
        let events = EventBuffer::new(options.event_capacity);
        let (event_queue, queued) = async_channel::unbounded();
        runtime.spawn(forward_events(queued, event_tx));
        let inner = Arc::new(Inner {
            name: config.name.clone(),
            addr: format!("{}:{}", config.host, config.port),
            config: Mutex::new(config),
            credentials,
            options,
            runtime,
            event_queue,
            session: Mutex::new(Session::new()),
            correlator: Mutex::new(Correlator::new()),
            events: Mutex::new(events),
            reconnect: Mutex::new(ReconnectTimer::new()),
        });
        Self {
            _owner: Arc::new(Owner {
                inner: Arc::downgrade(&inner),
            }),
            inner,
        }
    }

    /// Open the socket. A no-op while a socket is already connecting or open.
    pub fn connect(&self) -> Result<()> {
        self.inner.start_session()
    }

    /// Close the socket for good: cancels any pending reconnect, rejects
    /// every pending request and never reconnects again.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Send a request and wait for the reply with the same id.
    ///
    /// Only allowed after login. The reply is returned as-is; use `call` to
    /// unwrap the `{result, message, content|data}` envelope.
    pub async fn request(&self, code: &str, data: Value) -> Result<WireMessage> {
        self.ensure_logged_in()?;
        self.inner.send_request(code, data).await
    }

    /// `request` followed by envelope unwrapping: `result: false` becomes
    /// `ClientError::Domain`.
    pub async fn call(&self, code: &str, data: Value) -> Result<Option<Value>> {
        let reply = self.request(code, data).await?;
        ReplyEnvelope::from_value(reply.data).into_result()
    }

    /// Fire-and-forget send. Returns the id the message went out with; any
    /// reply to it is forwarded as an unsolicited `Message`.
    pub fn send(&self, code: &str, data: Value) -> Result<u64> {
        self.ensure_logged_in()?;
        let outbound = self.inner.outbound()?;
        let id = self.inner.correlator.lock().allocate();
        outbound
            .try_send(wire::encode_frame(&WireMessage::new(id, code, data)))
            .map_err(|_| ClientError::ConnectionLost)?;
        Ok(id)
    }

    /// Send a request whose replies keep coming: every message carrying its
    /// id is delivered until the subscription is dropped or the socket
    /// closes. The stream is registered before the request goes out.
    pub fn subscribe(&self, code: &str, data: Value) -> Result<Subscription> {
        self.ensure_logged_in()?;
        let outbound = self.inner.outbound()?;
        let (msg, rx) = self.inner.correlator.lock().subscribe(code, data);
        let id = msg.id;
        if outbound.try_send(wire::encode_frame(&msg)).is_err() {
            self.inner.correlator.lock().cancel(id);
            return Err(ClientError::ConnectionLost);
        }
        log::debug!("Subscribed `{}` #{} on {}", code, id, self.inner.addr);
        Ok(Subscription {
            id,
            rx,
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Answer a pending `SnConflict`. Returns false when no conflict is
    /// waiting (already resolved or the socket went away).
    pub fn resolve_sn_conflict(&self, decision: SnDecision) -> bool {
        let (remote, generation) = {
            let mut session = self.inner.session.lock();
            match session.sn_conflict.take() {
                Some(remote) => (remote, session.generation),
                None => return false,
            }
        };
        match decision {
            SnDecision::Accept => {
                log::info!("Accepted SN {} for {}", remote, self.inner.addr);
                self.inner.adopt_sn(remote);
                self.inner.spawn_login(generation);
            }
            SnDecision::Reject => {
                log::warn!("Rejected SN {} for {}", remote, self.inner.addr);
                self.inner.close();
            }
        }
        true
    }

    fn ensure_logged_in(&self) -> Result<()> {
        if self.inner.reconnect.lock().is_closing() {
            return Err(ClientError::Closed);
        }
        if !self.inner.session.lock().connected {
            return Err(ClientError::NotConnected);
        }
        Ok(())
    }

    /// Whether both handles drive the same socket.
    pub fn ptr_eq(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current config, including an adopted or accepted serial.
    pub fn config(&self) -> DeviceConfig {
        self.inner.config.lock().clone()
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.session.lock().status.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session.lock().connected
    }

    pub fn is_closed(&self) -> bool {
        self.inner.reconnect.lock().is_closing()
    }

    /// Beta flag from the last `info` push.
    pub fn is_beta(&self) -> bool {
        self.inner.session.lock().beta
    }

    /// Serial from the last `info` push.
    pub fn device_sn(&self) -> Option<String> {
        self.inner.session.lock().device_sn.clone()
    }

    /// Buffered events of the current session.
    pub fn events(&self) -> Vec<EventRecord> {
        self.inner.events.lock().snapshot()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.lock().len()
    }
}

/// Stream of replies to one request, from `Connection::subscribe`.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<WireMessage>,
    inner: Weak<Inner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next message, or `None` once the socket closed.
    pub async fn next(&mut self) -> Option<WireMessage> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.correlator.lock().cancel(self.id);
        }
    }
}

/// Moves queued events into the listener channel in order, waiting while
/// the listener is behind. Ends when the connection or the listener is gone.
async fn forward_events(
    queued: async_channel::Receiver<ConnectionEvent>,
    event_tx: async_channel::Sender<ConnectionEvent>,
) {
    while let Ok(event) = queued.recv().await {
        if event_tx.send(event).await.is_err() {
            break;
        }
    }
}

impl Inner {
    fn emit(&self, kind: ConnectionEventKind) {
        if kind.is_push() && self.event_queue.len() >= PUSH_BACKLOG {
            log::warn!("Listener behind, dropping push from {}", self.addr);
            return;
        }
        let event = ConnectionEvent {
            device: self.name.clone(),
            kind,
        };
        // Only fails once the listener is gone.
        let _ = self.event_queue.try_send(event);
    }

    fn close(self: &Arc<Self>) {
        self.reconnect.lock().close();
        let (live, task) = {
            let mut session = self.session.lock();
            (session.live, session.task.take())
        };
        if let Some(task) = task {
            task.abort();
        }
        match live {
            Some(generation) => {
                log::info!("Closing connection to {}", self.addr);
                self.on_socket_closed(generation, Some(1000), "closed by client".to_string());
            }
            None => {
                self.correlator.lock().fail_all(ClientError::ConnectionLost);
                self.set_status(ConnectionStatus::Idle);
            }
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        {
            let mut session = self.session.lock();
            if session.status == status {
                return;
            }
            session.status = status.clone();
        }
        self.emit(ConnectionEventKind::StatusChanged(status));
    }

    fn outbound(&self) -> Result<async_channel::Sender<String>> {
        self.session
            .lock()
            .outbound
            .clone()
            .ok_or(ClientError::NotConnected)
    }

    fn fresh_events(&self) -> EventBuffer {
        EventBuffer::new(self.options.event_capacity)
    }

    fn start_session(self: &Arc<Self>) -> Result<()> {
        if self.reconnect.lock().is_closing() {
            return Err(ClientError::Closed);
        }
        let generation = {
            let mut session = self.session.lock();
            if session.live.is_some() {
                return Ok(());
            }
            session.generation += 1;
            session.live = Some(session.generation);
            session.generation
        };
        self.set_status(ConnectionStatus::Connecting);

        let task = self.runtime.spawn(self.clone().run_session(generation));
        let mut session = self.session.lock();
        if session.live == Some(generation) {
            session.task = Some(task.abort_handle());
        } else {
            task.abort();
        }
        Ok(())
    }

    async fn run_session(self: Arc<Self>, generation: u64) {
        let ws_url = self.config.lock().ws_url();
        let ws_stream = match tokio_tungstenite::connect_async(&ws_url).await {
            Ok((stream, _response)) => stream,
            Err(e) => {
                log::warn!("WebSocket connect to {} failed: {}", self.addr, e);
                self.emit(ConnectionEventKind::TransportError(ClientError::Transport(
                    format!("WebSocket connect failed: {}", e),
                )));
                self.on_socket_closed(generation, None, e.to_string());
                return;
            }
        };

        let (mut ws_write, mut ws_read) = futures::StreamExt::split(ws_stream);
        let (out_tx, out_rx) = async_channel::unbounded::<String>();
        if !self.on_socket_open(generation, out_tx) {
            return;
        }

        // Writer: drains the queue, then closes the socket once the queue
        // is closed.
        let addr = self.addr.clone();
        let writer_handle = tokio::spawn(async move {
            while let Ok(text) = out_rx.recv().await {
                if let Err(e) = futures::SinkExt::send(
                    &mut ws_write,
                    tungstenite::Message::Text(text.into()),
                )
                .await
                {
                    log::warn!("Failed to send to {}: {}", addr, e);
                    break;
                }
            }
            let _ = futures::SinkExt::close(&mut ws_write).await;
        });

        // Reader loop
        let (code, reason) = loop {
            match futures::StreamExt::next(&mut ws_read).await {
                Some(Ok(tungstenite::Message::Text(text))) => self.handle_text(&text),
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    log::debug!("Ignoring {} byte binary frame from {}", data.len(), self.addr);
                }
                Some(Ok(tungstenite::Message::Ping(data))) => {
                    log::trace!("WS Ping received ({} bytes)", data.len());
                }
                Some(Ok(tungstenite::Message::Pong(_))) => {}
                Some(Ok(tungstenite::Message::Close(frame))) => {
                    log::info!("Device {} closed WebSocket connection", self.addr);
                    break match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                        None => (None, String::new()),
                    };
                }
                Some(Ok(tungstenite::Message::Frame(_))) => {}
                Some(Err(e)) => {
                    log::warn!("WebSocket error from {}: {}", self.addr, e);
                    self.emit(ConnectionEventKind::TransportError(ClientError::Transport(
                        e.to_string(),
                    )));
                    break (None, e.to_string());
                }
                None => break (None, "WebSocket stream ended".to_string()),
            }
        };
        writer_handle.abort();
        self.on_socket_closed(generation, code, reason);
    }

    fn on_socket_open(&self, generation: u64, outbound: async_channel::Sender<String>) -> bool {
        {
            let mut session = self.session.lock();
            if session.live != Some(generation) {
                return false;
            }
            session.outbound = Some(outbound);
        }
        log::info!("Connected to {}", self.addr);
        self.set_status(ConnectionStatus::Open);
        true
    }

    /// Reset all per-socket state. Every socket passes through here exactly
    /// once, whoever noticed the close first.
    fn on_socket_closed(self: &Arc<Self>, generation: u64, code: Option<u16>, reason: String) {
        let was_open = {
            let mut session = self.session.lock();
            if session.live != Some(generation) {
                return;
            }
            session.live = None;
            session.task = None;
            session.connected = false;
            session.backfilling = false;
            session.staged.clear();
            session.sn_conflict = None;
            match session.outbound.take() {
                Some(tx) => {
                    tx.close();
                    true
                }
                None => false,
            }
        };

        let failed = self.correlator.lock().fail_all(ClientError::ConnectionLost);
        if failed > 0 {
            log::info!("Rejected {} pending requests to {}", failed, self.addr);
        }
        let cleared = std::mem::replace(&mut *self.events.lock(), self.fresh_events());
        if !cleared.is_empty() {
            log::debug!(
                "Cleared {} buffered events of {} ({} evicted earlier)",
                cleared.len(),
                self.addr,
                cleared.evicted()
            );
        }

        if was_open {
            self.emit(ConnectionEventKind::Disconnected { code, reason });
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let delay = self.options.reconnect_delay;
        let weak = Arc::downgrade(self);
        let scheduled = self.reconnect.lock().schedule(|| {
            self.runtime
                .spawn(async move {
                    tokio::time::sleep(delay).await;
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    let fire = inner.reconnect.lock().fired();
                    if fire {
                        if let Err(e) = inner.start_session() {
                            log::debug!("Reconnect to {} skipped: {}", inner.addr, e);
                        }
                    }
                })
                .abort_handle()
        });

        if scheduled {
            log::info!(
                "Reconnecting to {} in {}ms",
                self.addr,
                delay.as_millis()
            );
            self.set_status(ConnectionStatus::Reconnecting);
        } else if self.reconnect.lock().is_closing() {
            self.set_status(ConnectionStatus::Idle);
        }
    }

    /// Tear down the current socket without closing the connection; the
    /// reconnect cycle takes over.
    fn drop_socket(self: &Arc<Self>, generation: u64, reason: &str) {
        let task = {
            let mut session = self.session.lock();
            if session.live != Some(generation) {
                return;
            }
            session.task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        self.on_socket_closed(generation, None, reason.to_string());
    }

    fn handle_text(self: &Arc<Self>, text: &str) {
        let inbound = match Inbound::parse(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                log::warn!("Dropping frame from {}: {}", self.addr, e);
                return;
            }
        };

        // Pushes are routed by code and never touch the correlator, even
        // when their id collides with a pending request.
        match inbound {
            Inbound::Info(info) => self.on_device_info(info),
            Inbound::Log(record) => self.emit(ConnectionEventKind::Log(record)),
            Inbound::Event(record) => {
                {
                    let mut session = self.session.lock();
                    if session.backfilling {
                        session.staged.push(record.clone());
                    } else if session.connected {
                        self.events.lock().push(record.clone());
                    }
                }
                self.emit(ConnectionEventKind::Event(record));
            }
            Inbound::AppEvent(record) => self.emit(ConnectionEventKind::AppEvent(record)),
            Inbound::Comm(record) => self.emit(ConnectionEventKind::Comm(record)),
            Inbound::Reply(msg) => {
                let unmatched = self.correlator.lock().dispatch(msg);
                if let Some(msg) = unmatched {
                    log::debug!("Unsolicited `{}` #{} from {}", msg.code, msg.id, self.addr);
                    self.emit(ConnectionEventKind::Message(msg));
                }
            }
        }
    }

    fn on_device_info(self: &Arc<Self>, info: DeviceInfo) {
        let generation = {
            let mut session = self.session.lock();
            session.device_sn = Some(info.sn.clone());
            session.beta = info.beta;
            session.generation
        };
        log::info!(
            "Device {} reports SN {} (beta: {})",
            self.addr,
            info.sn,
            info.beta
        );
        self.emit(ConnectionEventKind::DeviceInfo {
            sn: info.sn.clone(),
            beta: info.beta,
        });

        let configured = self.config.lock().expected_sn().map(str::to_string);
        match reconcile_sn(configured.as_deref(), &info.sn) {
            SnCheck::Match => self.spawn_login(generation),
            SnCheck::Adopt(sn) => {
                self.adopt_sn(sn);
                self.spawn_login(generation);
            }
            SnCheck::Conflict { remote, configured } => {
                log::warn!(
                    "Device {} reports SN {} but {} is configured; login held",
                    self.addr,
                    remote,
                    configured
                );
                self.session.lock().sn_conflict = Some(remote.clone());
                self.emit(ConnectionEventKind::SnConflict {
                    remote_sn: remote,
                    configured_sn: configured,
                });
            }
        }
    }

    fn adopt_sn(&self, sn: String) {
        self.config.lock().sn = Some(sn.clone());
        self.emit(ConnectionEventKind::SnUpdated { sn });
    }

    fn spawn_login(self: &Arc<Self>, generation: u64) {
        self.runtime.spawn(self.clone().login(generation));
    }

    async fn login(self: Arc<Self>, generation: u64) {
        let body = wire::request_body(&LoginRequest {
            user: &self.credentials.user,
            passwd: &self.credentials.password,
        });
        let outcome = match self.send_request(CODE_LOGIN, body).await {
            Ok(reply) => ReplyEnvelope::from_value(reply.data).into_result(),
            // Socket already gone; the close path has reset everything.
            Err(ClientError::ConnectionLost) | Err(ClientError::NotConnected) => return,
            Err(e) => Err(e),
        };
        if self.session.lock().live != Some(generation) {
            return;
        }

        match outcome {
            Ok(_) => self.on_logged_in(generation).await,
            Err(e) => {
                let message = match e {
                    ClientError::Domain(message) => message,
                    other => other.to_string(),
                };
                log::warn!("Login to {} failed: {}", self.addr, message);
                *self.events.lock() = self.fresh_events();
                self.emit(ConnectionEventKind::LoginFailed { message });
                self.drop_socket(generation, "login failed");
            }
        }
    }

    async fn on_logged_in(self: &Arc<Self>, generation: u64) {
        {
            let mut session = self.session.lock();
            session.connected = true;
            session.backfilling = true;
            session.staged.clear();
        }
        log::info!("Logged in to {}", self.addr);
        self.set_status(ConnectionStatus::LoggedIn);

        let history = match self.fetch_event_history().await {
            Ok(history) => history,
            Err(e) => {
                log::warn!("Event history fetch from {} failed: {}", self.addr, e);
                Vec::new()
            }
        };

        {
            let mut session = self.session.lock();
            if session.live != Some(generation) {
                return;
            }
            session.backfilling = false;
            let staged = std::mem::take(&mut session.staged);
            let mut events = self.fresh_events();
            events.extend(history);
            events.extend(staged);
            *self.events.lock() = events;
        }
        self.emit(ConnectionEventKind::Ready);
    }

    async fn fetch_event_history(&self) -> Result<Vec<EventRecord>> {
        let reply = self
            .send_request(CODE_EVENT_LIST, Value::Object(Default::default()))
            .await?;
        parse_event_list(ReplyEnvelope::from_value(reply.data).into_result()?)
    }

    /// Register, transmit, await. Does not check login so the handshake
    /// itself can use it.
    async fn send_request(&self, code: &str, data: Value) -> Result<WireMessage> {
        let outbound = self.outbound()?;
        let (msg, rx) = self.correlator.lock().prepare(code, data);
        let id = msg.id;
        if outbound.try_send(wire::encode_frame(&msg)).is_err() {
            self.correlator.lock().cancel(id);
            return Err(ClientError::ConnectionLost);
        }
        log::debug!("Sent `{}` #{} to {}", code, id, self.addr);

        match tokio::time::timeout(self.options.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(ClientError::ConnectionLost),
            Err(_) => {
                self.correlator.lock().cancel(id);
                log::warn!("Request `{}` #{} to {} timed out", code, id, self.addr);
                Err(ClientError::Timeout {
                    code: code.to_string(),
                    millis: self.options.request_timeout.as_millis() as u64,
                })
            }
        }
    }
}
