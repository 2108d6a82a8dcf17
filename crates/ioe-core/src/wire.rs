use crate::api::{AppEventRecord, CommRecord, DeviceInfo, EventRecord, LogRecord};
use crate::error::ClientError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Codes ──────────────────────────────────────────────────────────────────

pub const CODE_LOGIN: &str = "login";
pub const CODE_INFO: &str = "info";
pub const CODE_LOG: &str = "log";
pub const CODE_EVENT: &str = "event";
pub const CODE_APP_EVENT: &str = "app_event";
pub const CODE_COMM: &str = "comm";

pub const CODE_APP_LIST: &str = "app_list";
pub const CODE_APP_NEW: &str = "app_new";
pub const CODE_APP_START: &str = "app_start";
pub const CODE_APP_STOP: &str = "app_stop";
pub const CODE_APP_DOWNLOAD: &str = "app_download";
pub const CODE_DEVICE_INFO: &str = "device_info";
pub const CODE_EDITOR_GET: &str = "editor_get";
pub const CODE_EDITOR_POST: &str = "editor_post";
pub const CODE_EVENT_LIST: &str = "event_list";

/// Codes the device pushes on its own. These never go through the
/// correlation table, whatever id they carry.
pub const PUSH_CODES: [&str; 5] = [CODE_INFO, CODE_LOG, CODE_EVENT, CODE_APP_EVENT, CODE_COMM];

pub fn is_push_code(code: &str) -> bool {
    PUSH_CODES.contains(&code)
}

// ── Frame ──────────────────────────────────────────────────────────────────

/// One protocol message. One WebSocket text frame carries exactly one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: u64,
    pub code: String,
    #[serde(default)]
    pub data: Value,
}

impl WireMessage {
    pub fn new(id: u64, code: impl Into<String>, data: Value) -> Self {
        Self {
            id,
            code: code.into(),
            data,
        }
    }
}

/// Serialize a message into the text of a single frame.
pub fn encode_frame(msg: &WireMessage) -> String {
    serde_json::to_string(msg).expect("BUG: WireMessage must serialize")
}

/// Serialize a typed request body into the `data` field value.
pub fn request_body<T: serde::Serialize>(body: &T) -> Value {
    serde_json::to_value(body).expect("BUG: request body must serialize")
}

/// Parse the text of a single frame.
pub fn decode_frame(text: &str) -> Result<WireMessage, ClientError> {
    serde_json::from_str(text).map_err(|e| ClientError::Protocol(format!("bad frame: {}", e)))
}

// ── Inbound routing ────────────────────────────────────────────────────────

/// Decoded inbound message. Push codes get their own typed payload;
/// everything else is a reply candidate for the correlator.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    Info(DeviceInfo),
    Log(LogRecord),
    Event(EventRecord),
    AppEvent(AppEventRecord),
    Comm(CommRecord),
    /// Any other code: matched against pending requests by id, otherwise
    /// forwarded as an unsolicited message.
    Reply(WireMessage),
}

impl Inbound {
    pub fn from_wire(msg: WireMessage) -> Result<Self, ClientError> {
        fn payload<T: serde::de::DeserializeOwned>(
            code: &str,
            data: Value,
        ) -> Result<T, ClientError> {
            serde_json::from_value(data)
                .map_err(|e| ClientError::Protocol(format!("bad `{}` payload: {}", code, e)))
        }

        let inbound = match msg.code.as_str() {
            CODE_INFO => Inbound::Info(payload(CODE_INFO, msg.data)?),
            CODE_LOG => Inbound::Log(payload(CODE_LOG, msg.data)?),
            CODE_EVENT => Inbound::Event(payload(CODE_EVENT, msg.data)?),
            CODE_APP_EVENT => Inbound::AppEvent(payload(CODE_APP_EVENT, msg.data)?),
            CODE_COMM => Inbound::Comm(payload(CODE_COMM, msg.data)?),
            _ => Inbound::Reply(msg),
        };
        Ok(inbound)
    }

    pub fn parse(text: &str) -> Result<Self, ClientError> {
        Self::from_wire(decode_frame(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_has_three_fields() {
        let frame = encode_frame(&WireMessage::new(0, CODE_APP_LIST, json!({})));
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value, json!({"id": 0, "code": "app_list", "data": {}}));
    }

    #[test]
    fn decode_accepts_any_data_shape() {
        for data in [json!({"a": 1}), json!([1, 2]), json!("text"), json!(3), json!(null)] {
            let text = json!({"id": 7, "code": "x", "data": data}).to_string();
            let msg = decode_frame(&text).unwrap();
            assert_eq!(msg.id, 7);
            assert_eq!(msg.data, data);
        }
    }

    #[test]
    fn decode_missing_data_is_null() {
        let msg = decode_frame(r#"{"id": 1, "code": "app_list"}"#).unwrap();
        assert_eq!(msg.data, Value::Null);
    }

    #[test]
    fn decode_rejects_malformed_json() {
        assert!(matches!(decode_frame("{not json"), Err(ClientError::Protocol(_))));
        assert!(matches!(decode_frame(r#"{"code": "x"}"#), Err(ClientError::Protocol(_))));
    }

    #[test]
    fn push_codes_decode_to_typed_variants() {
        let info = Inbound::parse(r#"{"id":0,"code":"info","data":{"sn":"AAA","beta":true}}"#).unwrap();
        assert_eq!(
            info,
            Inbound::Info(DeviceInfo {
                sn: "AAA".into(),
                beta: true
            })
        );

        let event = Inbound::parse(
            r#"{"id":3,"code":"event","data":{"type":"SYS","app":"app1","level":1,"info":"started","data":{}}}"#,
        )
        .unwrap();
        assert!(matches!(event, Inbound::Event(ref e) if e.info == "started" && e.level == 1));

        let app_event = Inbound::parse(
            r#"{"id":0,"code":"app_event","data":{"app":"app1","event":"start"}}"#,
        )
        .unwrap();
        assert!(matches!(app_event, Inbound::AppEvent(ref e) if e.event == "start"));
    }

    #[test]
    fn non_push_codes_are_replies() {
        let msg = Inbound::parse(r#"{"id":4,"code":"app_list","data":{"result":true}}"#).unwrap();
        assert!(matches!(msg, Inbound::Reply(ref m) if m.id == 4));
        let msg = Inbound::parse(r#"{"id":0,"code":"login","data":{"result":true}}"#).unwrap();
        assert!(matches!(msg, Inbound::Reply(_)));
    }

    #[test]
    fn bad_push_payload_is_protocol_error() {
        let err = Inbound::parse(r#"{"id":0,"code":"info","data":[1]}"#).unwrap_err();
        assert!(matches!(err, ClientError::Protocol(ref m) if m.contains("info")));
    }

    #[test]
    fn push_code_set() {
        for code in ["info", "log", "event", "app_event", "comm"] {
            assert!(is_push_code(code));
        }
        assert!(!is_push_code("login"));
        assert!(!is_push_code("app_list"));
    }
}
