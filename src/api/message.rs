//! Purpose: Define the JSON message envelope and append/tail helpers for the API.
//! Exports: `Message`, `Meta`, `StoreApiExt`, `TailOptions`, `Tail`.
//! Role: Stable envelope aligned with the backplane wire contract.
//! Invariants: Message fields mirror the wire JSON; time is RFC3339 UTC.
//! Invariants: Tail polling preserves store ordering and avoids unbounded buffering.
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

use crate::core::error::{Error, ErrorKind};
use crate::core::fragment::Mapping;
use crate::core::ring::Ring;

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Meta {
    pub descrips: Vec<String>,
}

/// The envelope transports feed into the store and consume from batches.
/// The id is assigned by the backplane and expected to be non-decreasing
/// across appends; the store never inspects `data`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Message {
    pub id: u64,
    pub time: String,
    pub meta: Meta,
    pub data: Value,
}

impl Message {
    /// Build an envelope stamped with the current UTC time.
    pub fn new(id: u64, descrips: &[String], data: Value) -> Result<Self, Error> {
        Ok(Self {
            id,
            time: now_rfc3339()?,
            meta: Meta {
                descrips: descrips.to_vec(),
            },
            data,
        })
    }

    pub fn to_json(&self) -> Result<Value, Error> {
        serde_json::to_value(self).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("message encode failed")
                .with_mapping_id(self.id)
                .with_source(err)
        })
    }

    pub fn from_json(value: &Value) -> Result<Self, Error> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::new(ErrorKind::Corrupt).with_message("message is not object"))?;
        let id = obj
            .get("id")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| Error::new(ErrorKind::Corrupt).with_message("missing or invalid id"))?;
        let time = obj
            .get("time")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                Error::new(ErrorKind::Corrupt)
                    .with_message("missing time")
                    .with_mapping_id(id)
            })?
            .to_string();
        let meta_obj = obj
            .get("meta")
            .and_then(|v| v.as_object())
            .ok_or_else(|| {
                Error::new(ErrorKind::Corrupt)
                    .with_message("missing meta")
                    .with_mapping_id(id)
            })?;
        let descrips = meta_obj
            .get("descrips")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                Error::new(ErrorKind::Corrupt)
                    .with_message("meta.descrips must be array")
                    .with_mapping_id(id)
            })?
            .iter()
            .map(|item| item.as_str().map(|s| s.to_string()))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                Error::new(ErrorKind::Corrupt)
                    .with_message("meta.descrips must be string array")
                    .with_mapping_id(id)
            })?;
        let data = obj
            .get("data")
            .cloned()
            .ok_or_else(|| {
                Error::new(ErrorKind::Corrupt)
                    .with_message("missing data")
                    .with_mapping_id(id)
            })?;

        Ok(Self {
            id,
            time,
            meta: Meta { descrips },
            data,
        })
    }
}

impl Mapping for Message {
    fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Clone, Debug)]
pub struct TailOptions {
    pub since_seq: Option<u64>,
    pub max_messages: Option<usize>,
    pub poll_interval: Duration,
    pub timeout: Option<Duration>,
}

impl TailOptions {
    pub fn new() -> Self {
        Self {
            since_seq: None,
            max_messages: None,
            poll_interval: Duration::from_millis(50),
            timeout: None,
        }
    }
}

impl Default for TailOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Polling consumer that owns a cursor and drains batches one message at a
/// time, applying the standard advancement rule between reads.
pub struct Tail<'a> {
    store: &'a Ring<Message>,
    cursor: u64,
    options: TailOptions,
    seen: usize,
    deadline: Option<Instant>,
    pending: VecDeque<Arc<Message>>,
}

impl<'a> Tail<'a> {
    fn new(store: &'a Ring<Message>, options: TailOptions) -> Self {
        let deadline = options.timeout.map(|duration| Instant::now() + duration);
        Self {
            store,
            cursor: options.since_seq.unwrap_or(0),
            options,
            seen: 0,
            deadline,
            pending: VecDeque::new(),
        }
    }

    /// Next message, or `None` once the message budget or deadline is spent.
    pub fn next_message(&mut self) -> Option<Arc<Message>> {
        loop {
            if let Some(max) = self.options.max_messages {
                if self.seen >= max {
                    return None;
                }
            }
            if let Some(message) = self.pending.pop_front() {
                self.seen += 1;
                return Some(message);
            }
            if let Some(deadline) = self.deadline {
                if Instant::now() >= deadline {
                    return None;
                }
            }

            let batch = self.store.read(self.cursor);
            self.cursor = batch.advanced_cursor();
            if batch.messages.is_empty() {
                std::thread::sleep(self.options.poll_interval);
                continue;
            }
            self.pending.extend(batch.messages);
        }
    }
}

/// Envelope-level conveniences on the store, for callers speaking JSON.
pub trait StoreApiExt {
    fn append_json(
        &self,
        id: u64,
        descrips: &[String],
        data: &Value,
    ) -> Result<(u64, Arc<Message>), Error>;

    fn tail(&self, options: TailOptions) -> Tail<'_>;
}

impl StoreApiExt for Ring<Message> {
    fn append_json(
        &self,
        id: u64,
        descrips: &[String],
        data: &Value,
    ) -> Result<(u64, Arc<Message>), Error> {
        let message = Arc::new(Message::new(id, descrips, data.clone())?);
        let seq = self.append(Arc::clone(&message));
        Ok((seq, message))
    }

    fn tail(&self, options: TailOptions) -> Tail<'_> {
        Tail::new(self, options)
    }
}

fn now_rfc3339() -> Result<String, Error> {
    use time::format_description::well_known::Rfc3339;
    time::OffsetDateTime::now_utc().format(&Rfc3339).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("timestamp format failed")
            .with_source(err)
    })
}

#[cfg(test)]
mod tests {
    use super::{Message, Meta};
    use crate::core::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn envelope_round_trip() {
        let message = Message::new(40, &["event".to_string()], json!({"x": 1})).expect("message");
        let value = message.to_json().expect("encode");
        let decoded = Message::from_json(&value).expect("decode");
        assert_eq!(decoded, message);
        assert_eq!(
            decoded.meta,
            Meta {
                descrips: vec!["event".to_string()]
            }
        );
    }

    #[test]
    fn from_json_rejects_non_object() {
        let err = Message::from_json(&json!([1, 2])).expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn from_json_rejects_missing_id() {
        let err = Message::from_json(&json!({
            "time": "2026-08-01T00:00:00Z",
            "meta": {"descrips": []},
            "data": {}
        }))
        .expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn from_json_rejects_negative_id() {
        let err = Message::from_json(&json!({
            "id": -4,
            "time": "2026-08-01T00:00:00Z",
            "meta": {"descrips": []},
            "data": {}
        }))
        .expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn from_json_rejects_mixed_descrips() {
        let err = Message::from_json(&json!({
            "id": 4,
            "time": "2026-08-01T00:00:00Z",
            "meta": {"descrips": ["ok", 7]},
            "data": {}
        }))
        .expect_err("err");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn message_time_is_rfc3339() {
        let message = Message::new(1, &[], json!(null)).expect("message");
        assert!(message.time.ends_with('Z') || message.time.contains('+'));
    }
}
