use crate::error::ClientError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Reply envelope ─────────────────────────────────────────────────────────

/// Body of every request/reply pair: `{result, message?, content?|data?}`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    #[serde(default)]
    pub result: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ReplyEnvelope {
    /// Parse a raw reply payload. A payload that is not an object is treated
    /// as a failed reply rather than a protocol error.
    pub fn from_value(value: Value) -> Self {
        serde_json::from_value(value).unwrap_or_default()
    }

    /// Anything but `result: true` is a domain failure carrying `message`.
    /// On success returns `content`, falling back to `data`.
    pub fn into_result(self) -> Result<Option<Value>, ClientError> {
        if self.result {
            Ok(self.content.or(self.data))
        } else {
            Err(ClientError::Domain(
                self.message.unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
    }
}

// ── Pushed records ─────────────────────────────────────────────────────────

/// `info` push, sent by the device right after the socket opens.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub sn: String,
    #[serde(default)]
    pub beta: bool,
}

/// `log` push.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: f64,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub process: String,
    pub content: String,
}

/// `event` push; also the element type of `event_list`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub app: String,
    pub level: i64,
    pub info: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

/// `app_event` push.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppEventRecord {
    pub app: String,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// `comm` push: a raw frame the device exchanged with a field bus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommRecord {
    pub ts: f64,
    pub dir: String,
    pub sn: String,
    /// Base64 encoded payload.
    pub data: String,
}

impl CommRecord {
    pub fn payload(&self) -> Result<Vec<u8>, ClientError> {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .decode(self.data.as_bytes())
            .map_err(|e| ClientError::Protocol(format!("comm payload is not base64: {}", e)))
    }
}

// ── Device entities ────────────────────────────────────────────────────────

/// Application instance running on the device. Never cached by the client.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Application {
    /// Instance name; filled from the map key when the device omits it.
    #[serde(default)]
    pub inst: String,
    pub name: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conf: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub islocal: Option<i64>,
    #[serde(default)]
    pub sn: String,
    #[serde(default)]
    pub running: bool,
}

/// Parse the `app_list` reply body: an object keyed by instance name.
/// Entries are returned sorted by instance name.
pub fn parse_app_list(body: Option<Value>) -> Result<Vec<Application>, ClientError> {
    let map = match body {
        Some(Value::Object(map)) => map,
        Some(Value::Null) | None => return Ok(Vec::new()),
        Some(other) => {
            return Err(ClientError::Protocol(format!(
                "app_list body is not an object: {}",
                other
            )));
        }
    };
    let mut apps = Vec::with_capacity(map.len());
    for (key, value) in map {
        let mut app: Application = serde_json::from_value(value)?;
        if app.inst.is_empty() {
            app.inst = key;
        }
        apps.push(app);
    }
    apps.sort_by(|a, b| a.inst.cmp(&b.inst));
    Ok(apps)
}

/// Parse the `event_list` reply body: an array of event records, oldest first.
pub fn parse_event_list(body: Option<Value>) -> Result<Vec<EventRecord>, ClientError> {
    match body {
        Some(Value::Null) | None => Ok(Vec::new()),
        Some(value @ Value::Array(_)) => Ok(serde_json::from_value(value)?),
        Some(other) => Err(ClientError::Protocol(format!(
            "event_list body is not an array: {}",
            other
        ))),
    }
}

/// Children of an editor tree node: either loaded nodes or a flag telling
/// whether the node can be expanded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeChildren {
    Loaded(Vec<FileNode>),
    Expandable(bool),
}

impl Default for NodeChildren {
    fn default() -> Self {
        NodeChildren::Expandable(false)
    }
}

/// Node of the application file tree returned by the editor `get_node` call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileNode {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub children: NodeChildren,
}

impl FileNode {
    pub fn is_folder(&self) -> bool {
        self.kind == "folder"
    }

    pub fn is_directory(&self) -> bool {
        !matches!(self.children, NodeChildren::Expandable(false))
    }
}

/// Result of the editor `get_file_stat` call.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FileStat {
    /// `file`, `directory` or `link`
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub access: i64,
    #[serde(default)]
    pub modification: i64,
}

// ── Request bodies ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct LoginRequest<'a> {
    pub user: &'a str,
    pub passwd: &'a str,
}

#[derive(Debug, Serialize)]
pub struct AppNewRequest<'a> {
    pub app: &'a str,
    pub inst: &'a str,
}

#[derive(Debug, Serialize)]
pub struct AppInstRequest<'a> {
    pub inst: &'a str,
}

#[derive(Debug, Serialize)]
pub struct AppStopRequest<'a> {
    pub inst: &'a str,
    pub reason: &'a str,
}

#[derive(Debug, Serialize)]
pub struct AppDownloadRequest<'a> {
    pub inst: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<&'a str>,
}

/// Editor operations understood by `editor_get` / `editor_post`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EditorOperation {
    GetNode,
    GetContent,
    SetContentEx,
    RenameNode,
    DeleteNode,
    CreateNode,
    GetFileStat,
}

#[derive(Debug, Serialize)]
pub struct EditorRequest<'a> {
    pub app: &'a str,
    pub operation: EditorOperation,
    pub id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<&'a str>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub node_type: Option<&'a str>,
}

impl<'a> EditorRequest<'a> {
    pub fn new(app: &'a str, operation: EditorOperation, id: &'a str) -> Self {
        Self {
            app,
            operation,
            id,
            text: None,
            node_type: None,
        }
    }

    pub fn text(mut self, text: &'a str) -> Self {
        self.text = Some(text);
        self
    }

    pub fn node_type(mut self, node_type: &'a str) -> Self {
        self.node_type = Some(node_type);
        self
    }
}
