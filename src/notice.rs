//! Purpose: Define a stable, structured schema for reader slow-path notices.
//! Exports: `Notice`, `TraceSink`, `StderrTraceSink`, `notice_json`.
//! Role: Best-effort diagnostics for overrun/expired/fallback events; never load-bearing.
//! Invariants: Notices are non-fatal and never block or panic the read path.
//! Invariants: JSON schema is stable once published; fields are additive-only.
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: String,
    pub time: String,
    pub op: String,
    pub store: String,
    pub message: String,
    pub details: Map<String, Value>,
}

impl Notice {
    pub fn new(kind: impl Into<String>, op: impl Into<String>, store: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            time: now_rfc3339(),
            op: op.into(),
            store: store.into(),
            message: String::new(),
            details: Map::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_detail(mut self, key: &str, value: Value) -> Self {
        self.details.insert(key.to_string(), value);
        self
    }
}

pub fn notice_json(notice: &Notice) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(notice.kind));
    inner.insert("time".to_string(), json!(notice.time));
    inner.insert("op".to_string(), json!(notice.op));
    inner.insert("store".to_string(), json!(notice.store));
    inner.insert("message".to_string(), json!(notice.message));
    inner.insert("details".to_string(), Value::Object(notice.details.clone()));

    let mut outer = Map::new();
    outer.insert("notice".to_string(), Value::Object(inner));
    Value::Object(outer)
}

/// Receives slow-path notices. Implementations must not rely on delivery
/// order between threads and must return promptly; the reader invokes the
/// sink inline.
pub trait TraceSink: Send + Sync {
    fn record(&self, notice: &Notice);
}

/// Writes one JSON object per notice to stderr.
pub struct StderrTraceSink;

impl TraceSink for StderrTraceSink {
    fn record(&self, notice: &Notice) {
        eprintln!("{}", notice_json(notice));
    }
}

fn now_rfc3339() -> String {
    use time::format_description::well_known::Rfc3339;
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::{notice_json, Notice};
    use serde_json::json;

    #[test]
    fn notice_json_has_required_fields() {
        let notice = Notice::new("overrun", "read", "backplane-0")
            .with_message("cursor 3 fell behind; resuming at 8")
            .with_detail("cursor", json!(3))
            .with_detail("resume_seq", json!(8));

        let value = notice_json(&notice);
        let obj = value
            .get("notice")
            .and_then(|v| v.as_object())
            .expect("notice object");

        assert_eq!(obj.get("kind").and_then(|v| v.as_str()), Some("overrun"));
        assert_eq!(obj.get("op").and_then(|v| v.as_str()), Some("read"));
        assert_eq!(
            obj.get("store").and_then(|v| v.as_str()),
            Some("backplane-0")
        );
        assert_eq!(
            obj.get("message").and_then(|v| v.as_str()),
            Some("cursor 3 fell behind; resuming at 8")
        );
        let details = obj
            .get("details")
            .and_then(|v| v.as_object())
            .expect("details");
        assert_eq!(details.get("cursor"), Some(&json!(3)));
        assert_eq!(details.get("resume_seq"), Some(&json!(8)));
    }

    #[test]
    fn notice_time_is_rfc3339() {
        let notice = Notice::new("ahead", "read_since_mapping_id", "");
        assert!(notice.time.ends_with('Z') || notice.time.contains('+'));
    }
}
