//! Event records and the per-thread SPSC event ring.
//!
//! Every registered thread owns one [`EventRing`]; the thread (or the
//! monitor, for its own dedicated ring) is the sole producer and the logger
//! is the sole consumer. Producing is wait-free: a full ring drops the
//! record and increments the ignored count rather than blocking. Records are
//! plain old data and are written to the log verbatim, so the layout here is
//! the on-disk ABI.

use core::cell::UnsafeCell;
use core::mem;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::registry;
use crate::time;

/// Discriminants of the event records in the log.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum EventKind {
    /// A stack frame completed: arg1 = accumulated latency in nanoseconds,
    /// arg2 = return instruction pointer, arg3 = generation.
    Stack = 1,
    /// A request tag was set: arg1 = tag.
    TagSet = 2,
    /// A request tag was blocked: arg1 = tag.
    TagBlock = 3,
    /// A request tag was unset: arg1 = tag.
    TagUnset = 4,
    /// All request tags were cleared: no arguments.
    TagClear = 5,
    /// A mutex acquisition started waiting: arg1 = mutex address.
    MutexWait = 6,
    /// A mutex was acquired: arg1 = mutex address.
    MutexLock = 7,
    /// A mutex was released: arg1 = mutex address.
    MutexUnlock = 8,
    /// A thread join started waiting: arg1 = thread identifier.
    JoinWait = 9,
    /// A thread join completed: arg1 = thread identifier.
    JoinJoined = 10,
    /// A thread registered itself: arg1 = thread id.
    ThreadCreate = 11,
    /// A thread unregistered itself: arg1 = thread id, arg2 = number of
    /// records its ring dropped over its lifetime.
    ThreadExit = 12,
}

/// One fixed-size log record.
///
/// The field sequence is packed little-endian on disk exactly as laid out
/// here; there is no padding.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct EventRecord {
    /// Event kind, one of the [`EventKind`] discriminants.
    pub kind: u32,
    /// Timestamp seconds.
    pub sec: u32,
    /// Timestamp nanoseconds.
    pub nsec: u32,
    /// OS thread id of the thread the event describes.
    pub tid: u32,
    /// First argument, interpreted per kind.
    pub arg1: u64,
    /// Second argument, interpreted per kind.
    pub arg2: u64,
    /// Third argument, interpreted per kind.
    pub arg3: u64,
}

const _: () = assert!(mem::size_of::<EventRecord>() == 40);
const _: () = assert!(mem::align_of::<EventRecord>() == 8);

impl EventRecord {
    const ZERO: Self = Self {
        kind: 0,
        sec: 0,
        nsec: 0,
        tid: 0,
        arg1: 0,
        arg2: 0,
        arg3: 0,
    };

    /// Composes a record stamped with the given nanosecond timestamp.
    pub fn at(kind: EventKind, ns: u64, tid: u32, arg1: u64, arg2: u64, arg3: u64) -> Self {
        let (sec, nsec) = time::split_ns(ns);
        Self {
            kind: kind as u32,
            sec,
            nsec,
            tid,
            arg1,
            arg2,
            arg3,
        }
    }
}

/// Reinterprets a run of records as the bytes the logger writes.
pub fn records_as_bytes(records: &[EventRecord]) -> &[u8] {
    // SAFETY: `EventRecord` is plain old data with no padding.
    unsafe {
        core::slice::from_raw_parts(
            records.as_ptr().cast::<u8>(),
            mem::size_of_val(records),
        )
    }
}

/// A lock-free single-producer/single-consumer ring of [`EventRecord`]s.
///
/// `head` and `tail` are monotonically increasing; the slot index is the
/// counter masked by `capacity - 1`. The producer advances `tail` with
/// release ordering after the record is fully written; the consumer observes
/// `tail` with acquire ordering, so it never sees a partially written
/// record. Full means `tail - head == capacity`; the producer then drops the
/// record and bumps `ignored`.
pub struct EventRing {
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
    ignored: AtomicU64,
    slots: Box<[UnsafeCell<EventRecord>]>,
}

// SAFETY: Concurrent access is mediated by the head/tail protocol; the
// SPSC role contract is carried by the `unsafe` on `push` and `consume`.
unsafe impl Send for EventRing {}
unsafe impl Sync for EventRing {}

impl EventRing {
    /// Creates a ring with the given capacity, rounded up to a power of two.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(EventRecord::ZERO))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            mask: capacity - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            ignored: AtomicU64::new(0),
            slots,
        }
    }

    /// The ring's capacity in records.
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Number of records currently readable by the consumer.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    /// Whether the ring has no readable records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of records dropped because the ring was full.
    pub fn ignored(&self) -> u64 {
        self.ignored.load(Ordering::Relaxed)
    }

    /// Appends a record, dropping it if the ring is full. Returns whether
    /// the record was committed.
    ///
    /// # Safety
    ///
    /// The caller must be the ring's sole producer.
    pub unsafe fn push(&self, record: EventRecord) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) > self.mask {
            self.ignored.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        // SAFETY: The slot at `tail` is outside the consumer's readable
        // window until the release store below publishes it.
        unsafe { *self.slots[tail & self.mask].get() = record };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Feeds every readable record to `sink` as at most two contiguous
    /// runs, then advances the consumer index past them. Returns how many
    /// records were consumed.
    ///
    /// # Safety
    ///
    /// The caller must be the ring's sole consumer.
    pub unsafe fn consume<F: FnMut(&[EventRecord])>(&self, mut sink: F) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        let len = tail.wrapping_sub(head);
        if len == 0 {
            return 0;
        }
        let start = head & self.mask;
        let first = len.min(self.capacity() - start);
        // SAFETY: Records in `[head, tail)` are fully written (the acquire
        // load of `tail` synchronizes with the producer's release store) and
        // the producer will not overwrite them until `head` advances.
        unsafe {
            sink(self.run(start, first));
            if len > first {
                sink(self.run(0, len - first));
            }
        }
        self.head.store(head.wrapping_add(len), Ordering::Release);
        len
    }

    /// # Safety
    ///
    /// `[start, start + len)` must lie within the consumer's readable window.
    unsafe fn run(&self, start: usize, len: usize) -> &[EventRecord] {
        core::slice::from_raw_parts(self.slots[start].get().cast_const(), len)
    }
}

/// Posts an event from the calling thread into its own ring, stamped with
/// the current time. A no-op on unregistered threads.
pub(crate) fn post(kind: EventKind, arg1: u64, arg2: u64, arg3: u64) {
    post_at(kind, time::now_ns(), arg1, arg2, arg3);
}

/// Posts an event from the calling thread with an explicit timestamp.
pub(crate) fn post_at(kind: EventKind, ns: u64, arg1: u64, arg2: u64, arg3: u64) {
    registry::with_current(|slot, ring| {
        let record = EventRecord::at(kind, ns, slot.tid(), arg1, arg2, arg3);
        // SAFETY: The ring belongs to the calling thread, which is its sole
        // producer.
        unsafe { ring.push(record) };
    });
}
