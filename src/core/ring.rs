//! Purpose: Own the fragment array, watermark scalars, sizing, and the append path.
//! Exports: `Ring`, `RingOptions`.
//! Role: Container mutated by concurrent producers; cursor resolution lives in `cursor`.
//! Invariants: `next_free_seq` is non-decreasing and a lower bound on committed appends.
//! Invariants: An installed fragment's number is always congruent to its ring index.
//! Invariants: Displacing a populated fragment advances `min_seq` and `min_mapping_id`.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam_utils::CachePadded;

use crate::core::error::{Error, ErrorKind};
use crate::core::fragment::{Fragment, Mapping};
use crate::notice::{Notice, TraceSink};

/// Requested capacities below this are rounded up.
pub const MIN_CAPACITY: u32 = 32;

const MIN_FRAGMENT_COUNT: u32 = 4;

// Keeps a fragment's slot array below the large-allocation threshold.
#[cfg(target_pointer_width = "32")]
const MAX_FRAGMENT_SIZE: u32 = 16_384;
#[cfg(not(target_pointer_width = "32"))]
const MAX_FRAGMENT_SIZE: u32 = 8_192;

/// Construction inputs for a [`Ring`], mirroring the wire-in configuration of
/// the hosting backplane: a logical capacity plus an optional trace sink that
/// only ever fires on reader slow paths.
#[derive(Clone)]
pub struct RingOptions {
    pub capacity: u32,
    trace: Option<Arc<dyn TraceSink>>,
    trace_prefix: String,
}

impl RingOptions {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            trace: None,
            trace_prefix: String::new(),
        }
    }

    pub fn with_trace(mut self, sink: Arc<dyn TraceSink>, prefix: impl Into<String>) -> Self {
        self.trace = Some(sink);
        self.trace_prefix = prefix.into();
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Coordinates {
    pub fragment_num: u64,
    pub ring_index: usize,
    pub slot_index: usize,
}

/// The segmented circular log. Appends are lock-free; reads are wait-free and
/// pin whatever generation they observe, so a displaced fragment stays alive
/// until its last batch is dropped.
pub struct Ring<M> {
    fragments: Box<[ArcSwapOption<Fragment<M>>]>,
    fragment_size: usize,
    next_free_seq: CachePadded<AtomicU64>,
    min_seq: CachePadded<AtomicU64>,
    min_mapping_id: CachePadded<AtomicU64>,
    max_mapping: ArcSwapOption<M>,
    trace: Option<Arc<dyn TraceSink>>,
    trace_prefix: String,
}

impl<M> std::fmt::Debug for Ring<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("fragment_size", &self.fragment_size)
            .field("next_free_seq", &self.next_free_seq.load(Ordering::Relaxed))
            .field("min_seq", &self.min_seq.load(Ordering::Relaxed))
            .finish()
    }
}

impl<M: Mapping> Ring<M> {
    /// Build a ring for the requested logical capacity. The capacity is
    /// floored to [`MIN_CAPACITY`]; the actual window may exceed the request.
    pub fn new(options: RingOptions) -> Self {
        let capacity = options.capacity.max(MIN_CAPACITY);
        let fragment_size = capacity.div_ceil(MIN_FRAGMENT_COUNT).min(MAX_FRAGMENT_SIZE);
        // One extra slot smooths producer/consumer collision on wraparound.
        let fragment_count = capacity.div_ceil(fragment_size) + 1;
        Self::build(
            fragment_size as usize,
            fragment_count as usize,
            options.trace,
            options.trace_prefix,
        )
    }

    /// Explicit-geometry constructor used by tests and embedders that need an
    /// exact window shape rather than a capacity request.
    pub fn with_geometry(fragment_size: usize, fragment_count: usize) -> Result<Self, Error> {
        if fragment_size == 0 || fragment_count < 2 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("ring geometry needs at least one fragment of at least one slot"));
        }
        Ok(Self::build(fragment_size, fragment_count, None, String::new()))
    }

    fn build(
        fragment_size: usize,
        fragment_count: usize,
        trace: Option<Arc<dyn TraceSink>>,
        trace_prefix: String,
    ) -> Self {
        let fragments = (0..fragment_count)
            .map(|_| ArcSwapOption::const_empty())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            fragments,
            fragment_size,
            next_free_seq: CachePadded::new(AtomicU64::new(0)),
            min_seq: CachePadded::new(AtomicU64::new(0)),
            min_mapping_id: CachePadded::new(AtomicU64::new(0)),
            max_mapping: ArcSwapOption::const_empty(),
            trace,
            trace_prefix,
        }
    }

    /// Slots per fragment.
    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    /// Fragment slots in the ring, including the overflow cushion.
    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    /// Next sequence number to be assigned; a lower bound on committed appends.
    pub fn next_free_seq(&self) -> u64 {
        self.next_free_seq.load(Ordering::Acquire)
    }

    /// Lower bound of sequence numbers still addressable by a cursor.
    pub fn min_seq(&self) -> u64 {
        self.min_seq.load(Ordering::Acquire)
    }

    /// Lower bound of mapping ids still addressable.
    pub fn min_mapping_id(&self) -> u64 {
        self.min_mapping_id.load(Ordering::Acquire)
    }

    /// Most recently appended mapping. Best effort: it may trail the true
    /// maximum or briefly read absent after a wrap.
    pub fn max_mapping(&self) -> Option<Arc<M>> {
        self.max_mapping.load_full()
    }

    pub(crate) fn coordinates(&self, seq: u64) -> Coordinates {
        let fragment_num = seq / self.fragment_size as u64;
        Coordinates {
            fragment_num,
            ring_index: (fragment_num % self.fragments.len() as u64) as usize,
            slot_index: (seq % self.fragment_size as u64) as usize,
        }
    }

    pub(crate) fn seq_of(&self, fragment_num: u64, slot_index: usize) -> u64 {
        fragment_num * self.fragment_size as u64 + slot_index as u64
    }

    pub(crate) fn fragment_at(&self, ring_index: usize) -> Option<Arc<Fragment<M>>> {
        self.fragments[ring_index].load_full()
    }

    pub(crate) fn traced(&self) -> bool {
        self.trace.is_some()
    }

    pub(crate) fn trace_prefix(&self) -> &str {
        &self.trace_prefix
    }

    pub(crate) fn emit(&self, notice: &Notice) {
        if let Some(sink) = &self.trace {
            sink.record(notice);
        }
    }

    /// Append `mapping` to the log and return its assigned sequence number.
    /// Never fails; retries internally on contention. Lock-free, not
    /// wait-free: a producer can lose slot races indefinitely to faster
    /// peers, but each race resolves with some producer making progress.
    pub fn append(&self, mapping: Arc<M>) -> u64 {
        loop {
            let seq = self.next_free_seq.load(Ordering::Acquire);
            let coords = self.coordinates(seq);
            let slot = &self.fragments[coords.ring_index];
            let current = slot.load_full();

            match current.as_ref() {
                Some(fragment) if fragment.fragment_num() == coords.fragment_num => {
                    // Current generation: claim the first free slot at or
                    // after our coordinate.
                    for offset in coords.slot_index..self.fragment_size {
                        if fragment.publish_at(offset, Arc::clone(&mapping)) {
                            fragment.record_publish();
                            self.max_mapping.store(Some(mapping));
                            self.next_free_seq.fetch_add(1, Ordering::Release);
                            return self.seq_of(coords.fragment_num, offset);
                        }
                    }
                    // A faster producer filled the fragment under us.
                    continue;
                }
                Some(fragment) if fragment.fragment_num() > coords.fragment_num => {
                    // Our counter load was stale; the ring already moved on.
                    continue;
                }
                _ => {
                    if coords.slot_index != 0 {
                        // A producer that observed offset 0 installs the new
                        // fragment; wait for it.
                        std::hint::spin_loop();
                        continue;
                    }
                    let fresh = Arc::new(Fragment::seeded(
                        coords.fragment_num,
                        self.fragment_size,
                        Arc::clone(&mapping),
                    ));
                    let prev = slot.compare_and_swap(&current, Some(fresh));
                    if !same_generation(&prev, &current) {
                        // Another producer installed this fragment first.
                        continue;
                    }
                    if let Some(displaced) = current {
                        // fetch_max keeps the watermarks monotonic even when
                        // a stalled installer publishes its advance late.
                        self.min_seq
                            .fetch_max(displaced.max_seq() + 1, Ordering::AcqRel);
                        if let Some(last_id) = displaced.max_value() {
                            self.min_mapping_id.fetch_max(last_id, Ordering::AcqRel);
                        }
                    } else if coords.ring_index == 0 {
                        self.min_mapping_id
                            .fetch_max(mapping.id(), Ordering::AcqRel);
                    }
                    self.max_mapping.store(Some(mapping));
                    self.next_free_seq.fetch_add(1, Ordering::Release);
                    return self.seq_of(coords.fragment_num, 0);
                }
            }
        }
    }
}

fn same_generation<M>(a: &Option<Arc<Fragment<M>>>, b: &Option<Arc<Fragment<M>>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::{Ring, RingOptions, MIN_CAPACITY};
    use crate::core::fragment::Mapping;
    use std::sync::Arc;

    #[derive(Debug)]
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
    fn capacity_is_floored() {
        let ring: Ring<Packet> = Ring::new(RingOptions::new(1));
        assert_eq!(ring.fragment_size(), (MIN_CAPACITY / 4) as usize);
        assert_eq!(ring.fragment_count(), 5);
    }

    #[test]
    fn fragment_size_is_capped() {
        let ring: Ring<Packet> = Ring::new(RingOptions::new(100_000));
        assert_eq!(ring.fragment_size(), 8_192);
        assert_eq!(ring.fragment_count(), 100_000usize.div_ceil(8_192) + 1);
    }

    #[test]
    fn degenerate_geometry_is_rejected() {
        let err = Ring::<Packet>::with_geometry(0, 5).expect_err("zero slots");
        assert_eq!(err.kind(), crate::core::error::ErrorKind::Usage);
        let err = Ring::<Packet>::with_geometry(4, 1).expect_err("single slot ring");
        assert_eq!(err.kind(), crate::core::error::ErrorKind::Usage);
    }

    #[test]
    fn coordinates_round_trip() {
        let ring: Ring<Packet> = Ring::with_geometry(4, 5).expect("ring");
        let coords = ring.coordinates(13);
        assert_eq!(coords.fragment_num, 3);
        assert_eq!(coords.ring_index, 3);
        assert_eq!(coords.slot_index, 1);
        assert_eq!(ring.seq_of(coords.fragment_num, coords.slot_index), 13);
    }

    #[test]
    fn appends_assign_sequential_seqs() {
        let ring = Ring::with_geometry(4, 5).expect("ring");
        for (n, id) in (0u64..8).zip((10..).step_by(10)) {
            assert_eq!(ring.append(packet(id)), n);
        }
        assert_eq!(ring.next_free_seq(), 8);
        assert_eq!(ring.min_seq(), 0);
        assert_eq!(ring.max_mapping().map(|p| p.id()), Some(80));
    }

    #[test]
    fn first_population_sets_min_mapping_id() {
        let ring = Ring::with_geometry(4, 5).expect("ring");
        ring.append(packet(10));
        assert_eq!(ring.min_mapping_id(), 10);
    }

    #[test]
    fn displacement_advances_watermarks() {
        let ring = Ring::with_geometry(2, 3).expect("ring");
        for id in [10, 20, 30, 40, 50, 60] {
            ring.append(packet(id));
        }
        assert_eq!(ring.min_seq(), 0);
        // Seventh append installs generation 3 over generation 0.
        ring.append(packet(70));
        assert_eq!(ring.min_seq(), 2);
        assert_eq!(ring.min_mapping_id(), 20);
        assert_eq!(ring.next_free_seq(), 7);
    }

    #[test]
    fn installed_fragments_live_at_congruent_indexes() {
        let ring = Ring::with_geometry(2, 3).expect("ring");
        for id in 0..10u64 {
            ring.append(packet(id * 10));
        }
        for index in 0..ring.fragment_count() {
            let fragment = ring.fragment_at(index).expect("installed");
            assert_eq!(
                fragment.fragment_num() % ring.fragment_count() as u64,
                index as u64
            );
        }
    }
}
