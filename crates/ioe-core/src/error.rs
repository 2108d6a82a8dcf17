use thiserror::Error;

/// Everything a caller of the device client can observe as a failure.
///
/// Transport problems never reach callers directly: the connection retries on
/// its own and reports them as status changes. Callers only see the outcome for
/// their own request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// No logged-in session; the request was not sent.
    #[error("Device is not connected")]
    NotConnected,

    /// The socket went away while the request was waiting for its reply.
    #[error("Connection lost before the device replied")]
    ConnectionLost,

    /// No reply with a matching id arrived in time.
    #[error("Request `{code}` timed out after {millis}ms")]
    Timeout { code: String, millis: u64 },

    /// The device answered with `result: false`.
    #[error("{0}")]
    Domain(String),

    /// A mutation was attempted while the device is not in beta mode.
    #[error("Device is not in beta mode, application content cannot be edited")]
    NotBeta,

    /// A frame or reply payload could not be decoded.
    #[error("Malformed message: {0}")]
    Protocol(String),

    /// Socket-level failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The connection was closed explicitly and will not come back.
    #[error("Connection closed")]
    Closed,
}

impl ClientError {
    /// True for failures reported by the device itself rather than the link.
    pub fn is_domain(&self) -> bool {
        matches!(self, ClientError::Domain(_) | ClientError::NotBeta)
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
