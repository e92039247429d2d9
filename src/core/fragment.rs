//! Purpose: Define one fixed-size segment of the ring plus its slot publication rules.
//! Exports: `Mapping`, `Fragment`.
//! Role: Storage primitive shared by the append path and both read paths.
//! Invariants: A slot transitions absent -> published at most once per fragment lifetime.
//! Invariants: Published slots form a prefix; `length` only grows and may lag the true count.
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

/// Payload stored in the ring. The store never inspects anything but the id.
pub trait Mapping: Send + Sync + 'static {
    /// Caller-assigned id, expected to be non-decreasing across appends.
    fn id(&self) -> u64;
}

/// One contiguous segment of the log. Slots hold leaked `Arc` pointers that
/// are reclaimed when the fragment itself is dropped.
pub struct Fragment<M> {
    fragment_num: u64,
    data: Box<[AtomicPtr<M>]>,
    length: AtomicUsize,
    min_seq: u64,
    max_seq: u64,
    _owner: PhantomData<Arc<M>>,
}

impl<M: Mapping> Fragment<M> {
    /// Fragment seeded with its first mapping already published at offset 0.
    /// This is the shape a fragment has at installation time: a reader that
    /// wins the race to observe it sees a fully formed single-entry segment.
    pub fn seeded(fragment_num: u64, size: usize, first: Arc<M>) -> Self {
        let fragment = Self::bare(fragment_num, size);
        fragment.data[0].store(Arc::into_raw(first) as *mut M, Ordering::Relaxed);
        fragment.length.store(1, Ordering::Relaxed);
        fragment
    }

    fn bare(fragment_num: u64, size: usize) -> Self {
        let data = (0..size)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let min_seq = fragment_num * size as u64;
        Self {
            fragment_num,
            data,
            length: AtomicUsize::new(0),
            min_seq,
            max_seq: min_seq + size as u64 - 1,
            _owner: PhantomData,
        }
    }

    pub fn fragment_num(&self) -> u64 {
        self.fragment_num
    }

    pub fn min_seq(&self) -> u64 {
        self.min_seq
    }

    pub fn max_seq(&self) -> u64 {
        self.max_seq
    }

    pub fn length(&self) -> usize {
        self.length.load(Ordering::Acquire)
    }

    /// Called by a producer after it wins a slot; readers tolerate the lag
    /// between slot publication and this increment.
    pub fn record_publish(&self) {
        self.length.fetch_add(1, Ordering::Relaxed);
    }

    /// Atomically transition `data[offset]` from absent to `mapping`.
    /// `false` means another producer owns the slot; it is not an error.
    pub fn publish_at(&self, offset: usize, mapping: Arc<M>) -> bool {
        let raw = Arc::into_raw(mapping) as *mut M;
        match self.data[offset].compare_exchange(
            ptr::null_mut(),
            raw,
            Ordering::Release,
            Ordering::Relaxed,
        ) {
            Ok(_) => true,
            Err(_) => {
                // Lost the slot; take the reference back.
                unsafe { drop(Arc::from_raw(raw)) };
                false
            }
        }
    }

    /// Read one slot. A published slot never changes and `&self` keeps the
    /// fragment alive, so rebuilding a second `Arc` from the leaked pointer
    /// is sound.
    pub fn slot(&self, offset: usize) -> Option<Arc<M>> {
        let raw = self.data[offset].load(Ordering::Acquire);
        if raw.is_null() {
            return None;
        }
        unsafe {
            Arc::increment_strong_count(raw);
            Some(Arc::from_raw(raw))
        }
    }

    /// Collect the published slots in `[start, end)`. Stops at the first
    /// absent slot: published slots form a prefix, so everything after an
    /// absent slot is still in flight.
    pub fn snapshot(&self, start: usize, end: usize) -> Vec<Arc<M>> {
        let end = end.min(self.data.len());
        let mut out = Vec::with_capacity(end.saturating_sub(start));
        for offset in start..end {
            match self.slot(offset) {
                Some(mapping) => out.push(mapping),
                None => break,
            }
        }
        out
    }

    /// Advisory lower id bound; `None` while the first write is in flight.
    pub fn min_value(&self) -> Option<u64> {
        self.slot(0).map(|mapping| mapping.id())
    }

    /// Advisory upper id bound. Falls back to the first slot when `length`
    /// has not caught up with publication yet.
    pub fn max_value(&self) -> Option<u64> {
        let length = self.length().min(self.data.len());
        if length == 0 {
            return self.min_value();
        }
        match self.slot(length - 1) {
            Some(mapping) => Some(mapping.id()),
            None => self.min_value(),
        }
    }

    pub fn has_value(&self, id: u64) -> bool {
        match (self.min_value(), self.max_value()) {
            (Some(min), Some(max)) => id >= min && id <= max,
            _ => false,
        }
    }

    /// Binary search of the published prefix by mapping id, assuming ids were
    /// enqueued in non-decreasing order. Returns the first matching index.
    /// A torn probe (slot not yet visible) resolves as not-found.
    pub fn search(&self, id: u64) -> Option<usize> {
        let length = self.length().min(self.data.len());
        let mut low = 0usize;
        let mut high = length;
        while low < high {
            let mid = low + (high - low) / 2;
            let entry = self.slot(mid)?;
            if entry.id() < id {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        if low >= length {
            return None;
        }
        match self.slot(low) {
            Some(entry) if entry.id() == id => Some(low),
            _ => None,
        }
    }
}

impl<M> Drop for Fragment<M> {
    fn drop(&mut self) {
        for slot in self.data.iter_mut() {
            let raw = *slot.get_mut();
            if !raw.is_null() {
                unsafe { drop(Arc::from_raw(raw)) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Fragment, Mapping};
    use std::sync::Arc;

    #[derive(Debug, PartialEq, Eq)]
    struct Packet {
        id: u64,
    }

    impl Mapping for Packet {
        fn id(&self) -> u64 {
            self.id
        }
    }

    fn packet(id: u64) -> Arc<Packet> {
        Arc::new(Packet { id })
    }

    #[test]
    fn seeded_fragment_has_first_slot() {
        let fragment = Fragment::seeded(3, 4, packet(30));
        assert_eq!(fragment.fragment_num(), 3);
        assert_eq!(fragment.min_seq(), 12);
        assert_eq!(fragment.max_seq(), 15);
        assert_eq!(fragment.length(), 1);
        assert_eq!(fragment.slot(0).map(|p| p.id()), Some(30));
        assert_eq!(fragment.slot(1), None);
    }

    #[test]
    fn slots_publish_exactly_once() {
        let fragment = Fragment::seeded(0, 4, packet(10));
        assert!(fragment.publish_at(1, packet(20)));
        assert!(!fragment.publish_at(1, packet(99)));
        assert_eq!(fragment.slot(1).map(|p| p.id()), Some(20));
    }

    #[test]
    fn snapshot_stops_at_first_absent_slot() {
        let fragment = Fragment::seeded(0, 4, packet(10));
        assert!(fragment.publish_at(1, packet(20)));
        fragment.record_publish();
        let view = fragment.snapshot(0, 4);
        assert_eq!(view.len(), 2);
        assert_eq!(view[0].id(), 10);
        assert_eq!(view[1].id(), 20);
    }

    #[test]
    fn search_finds_published_ids() {
        let fragment = Fragment::seeded(0, 4, packet(10));
        for (offset, id) in [(1, 20), (2, 30), (3, 40)] {
            assert!(fragment.publish_at(offset, packet(id)));
            fragment.record_publish();
        }
        assert_eq!(fragment.search(10), Some(0));
        assert_eq!(fragment.search(30), Some(2));
        assert_eq!(fragment.search(40), Some(3));
        assert_eq!(fragment.search(25), None);
        assert_eq!(fragment.search(50), None);
    }

    #[test]
    fn search_returns_first_duplicate() {
        let fragment = Fragment::seeded(0, 4, packet(10));
        for offset in 1..4 {
            assert!(fragment.publish_at(offset, packet(20)));
            fragment.record_publish();
        }
        assert_eq!(fragment.search(20), Some(1));
    }

    #[test]
    fn advisory_bounds_track_published_prefix() {
        let fragment = Fragment::seeded(0, 4, packet(10));
        assert_eq!(fragment.min_value(), Some(10));
        assert_eq!(fragment.max_value(), Some(10));
        assert!(fragment.publish_at(1, packet(20)));
        fragment.record_publish();
        assert_eq!(fragment.max_value(), Some(20));
        assert!(fragment.has_value(15));
        assert!(!fragment.has_value(25));
    }

    #[test]
    fn dropping_a_fragment_releases_slots() {
        let first = packet(10);
        let fragment = Fragment::seeded(0, 4, Arc::clone(&first));
        assert_eq!(Arc::strong_count(&first), 2);
        drop(fragment);
        assert_eq!(Arc::strong_count(&first), 1);
    }
}
