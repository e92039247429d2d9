//! Purpose: Resolve reader cursors against the ring with overwrite safety.
//! Exports: `MessageBatch`.
//! Role: Read-side API; never mutates the ring and never fails.
//! Invariants: Batches expose committed prefixes only and pin their fragment.
//! Invariants: A cursor that fell behind resynchronizes to the oldest surviving fragment.
//! Invariants: Trace notices fire on slow paths only and never affect the result.
use std::sync::Arc;

use serde_json::json;

use crate::core::fragment::{Fragment, Mapping};
use crate::core::ring::Ring;
use crate::notice::Notice;

/// Result of one cursor resolution. `messages` share the payloads by
/// reference; holding a batch keeps its source fragment alive even after the
/// ring has moved on, so a stale batch is old data rather than a hazard.
#[derive(Clone)]
pub struct MessageBatch<M> {
    /// Cursor the batch was served from. For an overrun this is the start of
    /// the oldest surviving fragment, not the cursor that was asked for.
    pub next_cursor: u64,
    pub messages: Vec<Arc<M>>,
    pub has_more: bool,
}

impl<M> MessageBatch<M> {
    fn empty(next_cursor: u64) -> Self {
        Self {
            next_cursor,
            messages: Vec::new(),
            has_more: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Cursor a consumer should present on its next read.
    pub fn advanced_cursor(&self) -> u64 {
        self.next_cursor + self.messages.len() as u64
    }
}

impl<M: Mapping> Ring<M> {
    /// Read from a sequence cursor. Up to date returns the empty batch; a
    /// cursor inside the window returns the rest of its fragment; a cursor
    /// that fell behind is answered with the oldest surviving fragment and a
    /// corrected `next_cursor`.
    pub fn read(&self, cursor: u64) -> MessageBatch<M> {
        loop {
            let tip = self.next_free_seq();
            if tip <= cursor {
                return MessageBatch::empty(cursor);
            }

            let coords = self.coordinates(cursor);
            if let Some(fragment) = self.fragment_at(coords.ring_index) {
                if fragment.fragment_num() == coords.fragment_num {
                    let start = fragment.min_seq();
                    let next_start = start + self.fragment_size() as u64;
                    let end = tip.min(next_start);
                    let messages = fragment.snapshot(coords.slot_index, (end - start) as usize);
                    return MessageBatch {
                        next_cursor: cursor,
                        messages,
                        has_more: tip > next_start,
                    };
                }
            }

            // The cursor's fragment was overwritten. The slot after the
            // tip's is the one due to be overwritten next, which makes it
            // the oldest fragment safe to hand out.
            let tip_coords = self.coordinates(tip);
            let tail_index = (tip_coords.ring_index + 1) % self.fragment_count();
            if let Some(tail) = self.fragment_at(tail_index) {
                if tail.fragment_num() < tip_coords.fragment_num {
                    self.notice_overrun(cursor, &tail);
                    let length = tail.length().min(self.fragment_size());
                    return MessageBatch {
                        next_cursor: tail.min_seq(),
                        messages: tail.snapshot(0, length),
                        has_more: true,
                    };
                }
            }
            // The ring has not wrapped far enough to expose a stable tail
            // yet; re-read the tip and resolve again.
            std::hint::spin_loop();
        }
    }

    /// Read everything after the message whose payload id was `id`, for
    /// consumers whose cursor is expressed in mapping ids rather than
    /// sequence numbers.
    pub fn read_since_mapping_id(&self, id: u64) -> MessageBatch<M> {
        self.read_since_mapping_id_for_connection(id, None)
    }

    /// Same as [`read_since_mapping_id`](Self::read_since_mapping_id) with a
    /// connection id attached to any slow-path trace notices.
    pub fn read_since_mapping_id_for_connection(
        &self,
        id: u64,
        connection_id: Option<&str>,
    ) -> MessageBatch<M> {
        if let Some(fragment) = self.find_fragment_by_id(id) {
            if let Some(index) = fragment.search(id) {
                let cursor = self.seq_of(fragment.fragment_num(), index) + 1;
                return self.read(cursor);
            }
            // The id sits inside a fragment's advertised range but no slot
            // holds it any more: classified expired, answered with the
            // oldest fragment in full.
            self.notice_expired(id, connection_id);
            return self.all_from_min_seq(id, connection_id);
        }

        if id <= self.min_mapping_id() {
            self.notice_fallback(id, connection_id);
            return self.all_from_min_seq(id, connection_id);
        }

        // The id is ahead of the store's current view.
        self.notice_ahead(id, connection_id);
        MessageBatch::empty(self.next_free_seq())
    }

    /// Binary search over the ring as though it were indexed by mapping id,
    /// valid while producers enqueue ids in non-decreasing order.
    fn find_fragment_by_id(&self, id: u64) -> Option<Arc<Fragment<M>>> {
        let mut low = self.min_seq();
        let mut high = self.next_free_seq();
        while low <= high {
            let mid = low + (high - low) / 2;
            let coords = self.coordinates(mid);
            let fragment = self.fragment_at(coords.ring_index)?;
            let min_value = fragment.min_value()?;
            let max_value = fragment.max_value()?;
            if id < min_value {
                high = fragment.min_seq().checked_sub(1)?;
            } else if id > max_value {
                low = fragment.max_seq() + 1;
            } else if fragment.has_value(id) {
                return Some(fragment);
            } else {
                return None;
            }
        }
        None
    }

    /// Full dump of the oldest fragment, used when an id-based cursor can no
    /// longer be resolved precisely. An absent target means the ring is
    /// still warming; that reads as the empty caught-up batch.
    fn all_from_min_seq(&self, id: u64, connection_id: Option<&str>) -> MessageBatch<M> {
        let floor = self.min_seq();
        let coords = self.coordinates(floor);
        match self.fragment_at(coords.ring_index) {
            None => MessageBatch::empty(floor),
            Some(fragment) => {
                self.notice_dump(id, connection_id, &fragment);
                let length = fragment.length().min(self.fragment_size());
                MessageBatch {
                    next_cursor: fragment.min_seq(),
                    messages: fragment.snapshot(0, length),
                    has_more: true,
                }
            }
        }
    }

    fn notice_overrun(&self, cursor: u64, tail: &Fragment<M>) {
        if !self.traced() {
            return;
        }
        let notice = Notice::new("overrun", "read", self.trace_prefix())
            .with_message(format!(
                "cursor {cursor} fell behind; resuming at {}",
                tail.min_seq()
            ))
            .with_detail("cursor", json!(cursor))
            .with_detail("resume_seq", json!(tail.min_seq()))
            .with_detail("min_seq", json!(self.min_seq()));
        self.emit(&notice);
    }

    fn notice_expired(&self, id: u64, connection_id: Option<&str>) {
        if !self.traced() {
            return;
        }
        let notice = Notice::new("expired", "read_since_mapping_id", self.trace_prefix())
            .with_message(format!("mapping id {id} expired from the store"))
            .with_detail("mapping_id", json!(id))
            .with_detail("connection_id", json!(connection_id))
            .with_detail("min_mapping_id", json!(self.min_mapping_id()));
        self.emit(&notice);
    }

    fn notice_fallback(&self, id: u64, connection_id: Option<&str>) {
        if !self.traced() {
            return;
        }
        let notice = Notice::new("fallback", "read_since_mapping_id", self.trace_prefix())
            .with_message(format!(
                "mapping id {id} is below the store minimum; serving the oldest fragment"
            ))
            .with_detail("mapping_id", json!(id))
            .with_detail("connection_id", json!(connection_id))
            .with_detail("min_mapping_id", json!(self.min_mapping_id()));
        self.emit(&notice);
    }

    fn notice_ahead(&self, id: u64, connection_id: Option<&str>) {
        if !self.traced() {
            return;
        }
        let notice = Notice::new("ahead", "read_since_mapping_id", self.trace_prefix())
            .with_message(format!("mapping id {id} is ahead of the store"))
            .with_detail("mapping_id", json!(id))
            .with_detail("connection_id", json!(connection_id))
            .with_detail("next_free_seq", json!(self.next_free_seq()));
        self.emit(&notice);
    }

    fn notice_dump(&self, id: u64, connection_id: Option<&str>, fragment: &Fragment<M>) {
        if !self.traced() {
            return;
        }
        let notice = Notice::new("dump", "read_since_mapping_id", self.trace_prefix())
            .with_message(format!(
                "serving fragment {} in full for mapping id {id}",
                fragment.fragment_num()
            ))
            .with_detail("mapping_id", json!(id))
            .with_detail("connection_id", json!(connection_id))
            .with_detail("fragment_num", json!(fragment.fragment_num()))
            .with_detail("from_seq", json!(fragment.min_seq()));
        self.emit(&notice);
    }
}
