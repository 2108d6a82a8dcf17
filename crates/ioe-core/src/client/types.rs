use crate::api::{AppEventRecord, CommRecord, EventRecord, LogRecord};
use crate::error::ClientError;
use crate::wire::WireMessage;
use serde::{Deserialize, Serialize};

/// Status of a device connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// No socket. Initial state and the state after `close()`.
    Idle,
    /// Socket created, waiting for the transport to open
    Connecting,
    /// Transport open, waiting for `info` and the login reply
    Open,
    /// Login accepted; every request is allowed
    LoggedIn,
    /// Socket lost, a reconnect is scheduled
    Reconnecting,
}

impl ConnectionStatus {
    pub fn is_logged_in(&self) -> bool {
        matches!(self, ConnectionStatus::LoggedIn)
    }
}

/// Caller's answer to an SN conflict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnDecision {
    /// Trust the device's serial, adopt it and log in.
    Accept,
    /// Do not trust the device; close the connection for good.
    Reject,
}

/// Event sent from the connection task to whoever owns the listener channel.
#[derive(Clone, Debug)]
pub struct ConnectionEvent {
    /// Name of the device config the connection was built from
    pub device: String,
    pub kind: ConnectionEventKind,
}

#[derive(Clone, Debug)]
pub enum ConnectionEventKind {
    StatusChanged(ConnectionStatus),
    /// `info` push received
    DeviceInfo { sn: String, beta: bool },
    /// The device reports a serial different from the configured one.
    /// Login is held until `resolve_sn_conflict` is called.
    SnConflict { remote_sn: String, configured_sn: String },
    /// The configured serial changed (adopted or accepted); persist it.
    SnUpdated { sn: String },
    /// Login succeeded and the event backfill finished
    Ready,
    /// Login was refused; the socket is torn down
    LoginFailed { message: String },
    /// A socket that was open has closed
    Disconnected { code: Option<u16>, reason: String },
    /// Socket-level failure (connect refused, read error), always
    /// `ClientError::Transport`
    TransportError(ClientError),
    Log(LogRecord),
    Event(EventRecord),
    AppEvent(AppEventRecord),
    Comm(CommRecord),
    /// Message with an unknown code and no pending request
    Message(WireMessage),
}

impl ConnectionEventKind {
    /// Traffic pushed by the device, as opposed to connection lifecycle.
    /// Only these may be dropped when the listener falls behind.
    pub fn is_push(&self) -> bool {
        matches!(
            self,
            ConnectionEventKind::Log(_)
                | ConnectionEventKind::Event(_)
                | ConnectionEventKind::AppEvent(_)
                | ConnectionEventKind::Comm(_)
                | ConnectionEventKind::Message(_)
        )
    }
}
