//! In-process mock of a gateway device speaking the WebSocket protocol.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use futures::{SinkExt, StreamExt};
use ioe_core::client::{Connection, ConnectionEvent, ConnectionEventKind};
use ioe_core::config::{ConnectionOptions, Credentials, DeviceConfig};
use ioe_core::wire::{WireMessage, decode_frame};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;

/// Reply payload for a request, or `None` to never answer it.
pub type Responder = Arc<dyn Fn(&WireMessage) -> Option<Value> + Send + Sync>;

#[derive(Clone, Debug)]
pub enum Control {
    /// Send this frame to every connected client.
    Push(Value),
    /// Send this text verbatim, valid JSON or not.
    Raw(String),
    /// Close every open socket.
    DropAll,
}

pub struct MockDevice {
    pub port: u16,
    /// Every request the device received, in arrival order.
    pub requests: async_channel::Receiver<WireMessage>,
    control: broadcast::Sender<Control>,
    connections: Arc<AtomicUsize>,
    disconnects: Arc<AtomicUsize>,
}

impl MockDevice {
    pub async fn start(sn: &str, beta: bool, responder: Responder) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (requests_tx, requests) = async_channel::unbounded();
        let (control, _) = broadcast::channel(16);
        let connections = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));

        let info = json!({"id": 0, "code": "info", "data": {"sn": sn, "beta": beta}});
        let control_tx = control.clone();
        let accepted = connections.clone();
        let closed = disconnects.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                let session = serve(
                    socket,
                    info.clone(),
                    responder.clone(),
                    requests_tx.clone(),
                    control_tx.subscribe(),
                );
                let closed = closed.clone();
                tokio::spawn(async move {
                    session.await;
                    closed.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        Self {
            port,
            requests,
            control,
            connections,
            disconnects,
        }
    }

    pub fn push(&self, frame: Value) {
        let _ = self.control.send(Control::Push(frame));
    }

    pub fn push_raw(&self, text: &str) {
        let _ = self.control.send(Control::Raw(text.to_string()));
    }

    pub fn drop_all(&self) {
        let _ = self.control.send(Control::DropAll);
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Sockets that have ended, from either side.
    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Next recorded request, skipping the handshake ones.
    pub async fn next_request(&self) -> WireMessage {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.requests.recv())
                .await
                .expect("no request reached the device")
                .unwrap();
            if msg.code != "login" && msg.code != "event_list" {
                return msg;
            }
        }
    }

    /// Drain everything recorded so far.
    pub fn drain(&self) -> Vec<WireMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = self.requests.try_recv() {
            out.push(msg);
        }
        out
    }
}

async fn serve(
    socket: TcpStream,
    info: Value,
    responder: Responder,
    requests_tx: async_channel::Sender<WireMessage>,
    mut control_rx: broadcast::Receiver<Control>,
) {
    let Ok(stream) = tokio_tungstenite::accept_async(socket).await else {
        return;
    };
    let (mut writer, mut reader) = stream.split();
    if writer.send(Message::Text(info.to_string().into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let msg = decode_frame(&text).unwrap();
                    let _ = requests_tx.send(msg.clone()).await;
                    if let Some(data) = responder(&msg) {
                        let reply = json!({"id": msg.id, "code": msg.code, "data": data});
                        if writer.send(Message::Text(reply.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            control = control_rx.recv() => match control {
                Ok(Control::Push(frame)) => {
                    if writer.send(Message::Text(frame.to_string().into())).await.is_err() {
                        break;
                    }
                }
                Ok(Control::Raw(text)) => {
                    if writer.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Ok(Control::DropAll) | Err(_) => {
                    let _ = writer.close().await;
                    break;
                }
            },
        }
    }
}

/// Accepts the login, returns an empty history and `{result: true}` for
/// everything else.
pub fn default_reply(msg: &WireMessage) -> Value {
    match msg.code.as_str() {
        "event_list" => json!({"result": true, "data": []}),
        _ => json!({"result": true}),
    }
}

pub fn responder(f: impl Fn(&WireMessage) -> Option<Value> + Send + Sync + 'static) -> Responder {
    Arc::new(f)
}

pub fn accept_all() -> Responder {
    responder(|msg| Some(default_reply(msg)))
}

pub fn test_options() -> ConnectionOptions {
    ConnectionOptions {
        reconnect_delay: Duration::from_millis(100),
        request_timeout: Duration::from_secs(2),
        restart_delay: Duration::from_millis(100),
        event_capacity: 100,
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn connection(
    port: u16,
    sn: Option<&str>,
    options: ConnectionOptions,
) -> (Connection, async_channel::Receiver<ConnectionEvent>) {
    init_logging();
    let mut config = DeviceConfig::new("dev", "127.0.0.1", port);
    config.sn = sn.map(str::to_string);
    let (tx, rx) = async_channel::bounded(256);
    let conn = Connection::new(
        config,
        Credentials::default(),
        options,
        tokio::runtime::Handle::current(),
        tx,
    );
    (conn, rx)
}

pub async fn wait_for(
    events: &async_channel::Receiver<ConnectionEvent>,
    pred: impl Fn(&ConnectionEventKind) -> bool,
) -> ConnectionEventKind {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event not emitted in time")
            .unwrap();
        if pred(&event.kind) {
            return event.kind;
        }
    }
}

pub async fn wait_ready(events: &async_channel::Receiver<ConnectionEvent>) {
    wait_for(events, |k| matches!(k, ConnectionEventKind::Ready)).await;
}
