use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Response from the session endpoint granting a one-time socket URL.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ConnectInfo {
    pub ok: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ConnectInfo {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Body of an outbound message: plain text or a caller-built structure.
///
/// The structured form is merged into the envelope field-by-field, so callers
/// can attach attachments/blocks or override envelope defaults.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Text(String),
    Structured(Map<String, Value>),
}

impl From<&str> for MessageBody {
    fn from(text: &str) -> Self {
        MessageBody::Text(text.to_string())
    }
}

impl From<String> for MessageBody {
    fn from(text: String) -> Self {
        MessageBody::Text(text)
    }
}

impl From<Map<String, Value>> for MessageBody {
    fn from(fields: Map<String, Value>) -> Self {
        MessageBody::Structured(fields)
    }
}

/// Outbound message envelope.
///
/// Starts as `{"type": "message", "channel": ...}`, merges the body in
/// (caller-supplied fields win), and receives its `id` from the dispatcher as
/// the final step before transmission.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(transparent)]
pub struct Envelope {
    fields: Map<String, Value>,
}

impl Envelope {
    pub fn new(channel: &str, body: MessageBody) -> Self {
        let mut fields = Map::new();
        fields.insert("type".to_string(), Value::String("message".to_string()));
        fields.insert("channel".to_string(), Value::String(channel.to_string()));
        match body {
            MessageBody::Text(text) => {
                fields.insert("text".to_string(), Value::String(text));
            }
            MessageBody::Structured(extra) => {
                for (key, value) in extra {
                    fields.insert(key, value);
                }
            }
        }
        Self { fields }
    }

    /// Wraps a caller-built envelope. Returns `None` for non-object values.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self { fields }),
            _ => None,
        }
    }

    pub fn set_thread_ts(&mut self, anchor: &str) {
        self.fields
            .insert("thread_ts".to_string(), Value::String(anchor.to_string()));
    }

    pub fn assign_id(&mut self, id: u64) {
        self.fields.insert("id".to_string(), Value::from(id));
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.fields)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

/// One entry in the recent-activity record: either a decoded inbound gateway
/// event, or a synthetic diagnostic entry tagged `log` or `exception`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct EventRecord {
    fields: Map<String, Value>,
}

impl EventRecord {
    /// Decodes an inbound text frame. The gateway only ever sends JSON
    /// objects; anything else is rejected.
    pub fn from_frame(text: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            _ => Err(serde::de::Error::custom("frame is not a JSON object")),
        }
    }

    pub fn log(text: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("type".to_string(), Value::String("log".to_string()));
        fields.insert("text".to_string(), Value::String(text.to_string()));
        Self { fields }
    }

    pub fn log_with_error(text: &str, error: Value) -> Self {
        let mut entry = Self::log(text);
        entry.fields.insert("error".to_string(), error);
        entry
    }

    pub fn exception(text: &str, error: &dyn std::fmt::Display) -> Self {
        let mut fields = Map::new();
        fields.insert("type".to_string(), Value::String("exception".to_string()));
        fields.insert("text".to_string(), Value::String(text.to_string()));
        fields.insert("error".to_string(), Value::String(error.to_string()));
        Self { fields }
    }

    pub fn event_type(&self) -> Option<&str> {
        self.str_field("type")
    }

    pub fn channel(&self) -> Option<&str> {
        self.str_field("channel")
    }

    pub fn ts(&self) -> Option<&str> {
        self.str_field("ts")
    }

    pub fn thread_ts(&self) -> Option<&str> {
        self.str_field("thread_ts")
    }

    /// Reply-confirmation marker. Present (any non-null value) on frames the
    /// gateway sends to acknowledge an earlier client message.
    pub fn reply_to(&self) -> Option<&Value> {
        self.fields.get("reply_to").filter(|value| !value.is_null())
    }

    pub fn text(&self) -> Option<&str> {
        self.str_field("text")
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }
}

impl From<Map<String, Value>> for EventRecord {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{ConnectInfo, Envelope, EventRecord, MessageBody};

    #[test]
    fn connect_info_parses_granted_session() {
        let info = ConnectInfo::from_text(r#"{"ok":true,"url":"wss://gw.example/ws"}"#)
            .expect("parse connect response");
        assert!(info.ok);
        assert_eq!(info.url.as_deref(), Some("wss://gw.example/ws"));
        assert_eq!(info.error, None);
    }

    #[test]
    fn connect_info_parses_rejection() {
        let info = ConnectInfo::from_text(r#"{"ok":false,"error":"invalid_auth"}"#)
            .expect("parse rejection");
        assert!(!info.ok);
        assert_eq!(info.url, None);
        assert_eq!(info.error.as_deref(), Some("invalid_auth"));
    }

    #[test]
    fn text_envelope_has_exact_wire_shape() {
        let mut envelope = Envelope::new("C123", MessageBody::from("hi"));
        envelope.assign_id(0);
        assert_eq!(
            envelope.into_value(),
            json!({"id": 0, "type": "message", "channel": "C123", "text": "hi"})
        );
    }

    #[test]
    fn structured_body_fields_win_over_defaults() {
        let Value::Object(fields) = json!({"channel": "C999", "attachments": [{"title": "t"}]})
        else {
            unreachable!()
        };
        let envelope = Envelope::new("C123", MessageBody::from(fields));
        assert_eq!(
            envelope.get("channel"),
            Some(&Value::String("C999".to_string()))
        );
        assert_eq!(
            envelope.get("type"),
            Some(&Value::String("message".to_string()))
        );
        assert!(envelope.get("attachments").is_some());
        assert!(envelope.get("text").is_none());
    }

    #[test]
    fn assign_id_overrides_structured_id() {
        let Value::Object(fields) = json!({"id": 99, "text": "x"}) else {
            unreachable!()
        };
        let mut envelope = Envelope::new("C1", MessageBody::from(fields));
        envelope.assign_id(3);
        assert_eq!(envelope.get("id"), Some(&json!(3)));
    }

    #[test]
    fn thread_anchor_lands_in_envelope() {
        let mut envelope = Envelope::new("C1", MessageBody::from("reply"));
        envelope.set_thread_ts("1111.2222");
        assert_eq!(
            envelope.get("thread_ts"),
            Some(&Value::String("1111.2222".to_string()))
        );
    }

    #[test]
    fn from_value_rejects_non_objects() {
        assert!(Envelope::from_value(json!(["not", "an", "object"])).is_none());
        assert!(Envelope::from_value(json!("text")).is_none());
        assert!(Envelope::from_value(json!({"type": "message"})).is_some());
    }

    #[test]
    fn event_record_exposes_frame_fields() {
        let event = EventRecord::from_frame(
            r#"{"type":"message","channel":"C42","user":"U1","ts":"1.2","text":"hello"}"#,
        )
        .expect("decode frame");
        assert_eq!(event.event_type(), Some("message"));
        assert_eq!(event.channel(), Some("C42"));
        assert_eq!(event.ts(), Some("1.2"));
        assert_eq!(event.thread_ts(), None);
        assert_eq!(event.text(), Some("hello"));
        assert!(event.reply_to().is_none());
    }

    #[test]
    fn reply_marker_ignores_explicit_null() {
        let replied = EventRecord::from_frame(r#"{"type":"message","reply_to":7}"#).unwrap();
        assert!(replied.reply_to().is_some());

        let unreplied = EventRecord::from_frame(r#"{"type":"message","reply_to":null}"#).unwrap();
        assert!(unreplied.reply_to().is_none());
    }

    #[test]
    fn non_object_frames_are_rejected() {
        assert!(EventRecord::from_frame("[1,2,3]").is_err());
        assert!(EventRecord::from_frame("not json").is_err());
    }

    #[test]
    fn diagnostic_entries_carry_tag_text_and_error() {
        let plain = EventRecord::log("fetching gateway socket url");
        assert_eq!(plain.event_type(), Some("log"));
        assert_eq!(plain.text(), Some("fetching gateway socket url"));
        assert!(plain.get("error").is_none());

        let failed = EventRecord::log_with_error("fetch failed", json!({"status": 500}));
        assert_eq!(failed.event_type(), Some("log"));
        assert_eq!(failed.get("error"), Some(&json!({"status": 500})));

        let raised = EventRecord::exception("event hook failed", &"boom");
        assert_eq!(raised.event_type(), Some("exception"));
        assert_eq!(raised.get("error"), Some(&Value::String("boom".to_string())));
    }
}
