//! The shared thread registry.
//!
//! A fixed-size slot table maps a logical thread index to the thread's OS
//! id, TLS base, stack base, mutex timestamps, and event ring. Slots are
//! claimed and released under a spinlock, only across thread create/exit;
//! the monitor and logger read the table lock-free. The TLS pointer is the
//! publication barrier: it is stored last (release) on claim and cleared
//! first on release, and a null TLS pointer means the slot is free.
//!
//! A dead thread's ring is not freed by the exiting thread. It is moved to
//! a retired list and disposed of by the logger after a final drain, so the
//! logger may hold a raw ring pointer across a concurrent thread exit.

use core::cell::Cell;
use core::ptr::null_mut;
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::event::{EventKind, EventRecord, EventRing};
use crate::time;

/// Capacity of the slot table.
pub(crate) const MAX_THREADS: usize = 128;

/// One registry entry. Cache-aligned so the monitor's per-slot reads do not
/// false-share with neighboring slots' producers.
#[repr(align(64))]
pub(crate) struct Slot {
    /// Published TLS base; null marks the slot free.
    tls: AtomicPtr<u64>,
    /// Highest frame address the monitor accepts for this thread.
    stack_base: AtomicUsize,
    /// OS thread id.
    tid: AtomicU32,
    /// The thread's event ring; owned here while live, retired on release.
    ring: AtomicPtr<EventRing>,
    /// Most recent mutex wait timestamp, nanoseconds.
    ts_wait: AtomicU64,
    /// Most recent mutex acquire timestamp, nanoseconds.
    ts_lock: AtomicU64,
}

impl Slot {
    const fn new() -> Self {
        Self {
            tls: AtomicPtr::new(null_mut()),
            stack_base: AtomicUsize::new(0),
            tid: AtomicU32::new(0),
            ring: AtomicPtr::new(null_mut()),
            ts_wait: AtomicU64::new(0),
            ts_lock: AtomicU64::new(0),
        }
    }

    /// Where the published-TLS atomic lives, for sequence-lock re-checks.
    /// Null means the slot is free.
    pub(crate) fn tls_word(&self) -> &AtomicPtr<u64> {
        &self.tls
    }

    pub(crate) fn stack_base(&self) -> usize {
        self.stack_base.load(Ordering::Relaxed)
    }

    pub(crate) fn tid(&self) -> u32 {
        self.tid.load(Ordering::Relaxed)
    }

    pub(crate) fn ring_ptr(&self) -> *mut EventRing {
        self.ring.load(Ordering::Acquire)
    }

    pub(crate) fn ts_wait(&self) -> u64 {
        self.ts_wait.load(Ordering::Relaxed)
    }

    pub(crate) fn set_ts_wait(&self, ns: u64) {
        self.ts_wait.store(ns, Ordering::Relaxed);
    }

    pub(crate) fn ts_lock(&self) -> u64 {
        self.ts_lock.load(Ordering::Relaxed)
    }

    pub(crate) fn set_ts_lock(&self, ns: u64) {
        self.ts_lock.store(ns, Ordering::Relaxed);
    }
}

/// The slot table plus its create/exit spinlock.
pub(crate) struct Registry {
    slots: [Slot; MAX_THREADS],
    /// Number of live slots.
    nthread: AtomicUsize,
    /// High-water mark: the monitor and logger scan `0..max_idx`.
    max_idx: AtomicUsize,
    /// Held only across claim/release.
    lock: spin::Mutex<()>,
    /// Rings of exited threads, awaiting a final drain by the logger.
    retired: spin::Mutex<Vec<Box<EventRing>>>,
}

impl Registry {
    pub(crate) const fn new() -> Self {
        const SLOT: Slot = Slot::new();
        Self {
            slots: [SLOT; MAX_THREADS],
            nthread: AtomicUsize::new(0),
            max_idx: AtomicUsize::new(0),
            lock: spin::Mutex::new(()),
            retired: spin::Mutex::new(Vec::new()),
        }
    }

    /// Claims the lowest free slot for the calling thread and publishes it.
    /// Returns `None` when the table is full.
    pub(crate) fn acquire(
        &self,
        tid: u32,
        tls: *mut u64,
        stack_base: usize,
        ring: Box<EventRing>,
    ) -> Option<usize> {
        debug_assert!(!tls.is_null());
        let _guard = self.lock.lock();

        let idx = (0..MAX_THREADS).find(|&i| self.slots[i].tls.load(Ordering::Relaxed).is_null());
        let Some(idx) = idx else {
            log::warn!(
                target: "ldb::registry",
                "thread table full ({} live of {}); thread {} unobserved",
                self.live(),
                MAX_THREADS,
                tid
            );
            return None;
        };

        let now = time::now_ns();
        let slot = &self.slots[idx];
        slot.tid.store(tid, Ordering::Relaxed);
        slot.stack_base.store(stack_base, Ordering::Relaxed);
        slot.ts_wait.store(now, Ordering::Relaxed);
        slot.ts_lock.store(now, Ordering::Relaxed);
        slot.ring.store(Box::into_raw(ring), Ordering::Release);
        // Publish last; from here the monitor may scan the thread.
        slot.tls.store(tls, Ordering::Release);

        self.nthread.fetch_add(1, Ordering::Relaxed);
        if idx + 1 > self.max_idx.load(Ordering::Relaxed) {
            self.max_idx.store(idx + 1, Ordering::Relaxed);
        }
        Some(idx)
    }

    /// Releases a slot on thread exit: posts the thread-exit record (with
    /// the ring's ignored count), unpublishes the TLS pointer, retires the
    /// ring, and walks the high-water mark down past trailing free slots.
    ///
    /// Must be called by the thread that owns the slot (it is the ring's
    /// producer).
    pub(crate) fn release(&self, idx: usize) {
        let _guard = self.lock.lock();
        let slot = &self.slots[idx];

        let ring_ptr = slot.ring.load(Ordering::Relaxed);
        if !ring_ptr.is_null() {
            // SAFETY: The ring is alive until retired below, and the caller
            // is its sole producer.
            let ring = unsafe { &*ring_ptr };
            let record = EventRecord::at(
                EventKind::ThreadExit,
                time::now_ns(),
                slot.tid(),
                slot.tid() as u64,
                ring.ignored(),
                0,
            );
            unsafe { ring.push(record) };
        }

        // Unpublish first; the monitor stops scanning this thread.
        slot.tls.store(null_mut(), Ordering::Release);

        let ring_ptr = slot.ring.swap(null_mut(), Ordering::Release);
        if !ring_ptr.is_null() {
            // SAFETY: `ring_ptr` came from `Box::into_raw` in `acquire`.
            self.retired.lock().push(unsafe { Box::from_raw(ring_ptr) });
        }

        slot.tid.store(0, Ordering::Relaxed);
        slot.stack_base.store(0, Ordering::Relaxed);
        slot.ts_wait.store(0, Ordering::Relaxed);
        slot.ts_lock.store(0, Ordering::Relaxed);

        let mut max = self.max_idx.load(Ordering::Relaxed);
        while max > 0 && self.slots[max - 1].tls.load(Ordering::Relaxed).is_null() {
            max -= 1;
        }
        self.max_idx.store(max, Ordering::Relaxed);
        self.nthread.fetch_sub(1, Ordering::Relaxed);
    }

    /// The current high-water mark, read lock-free.
    pub(crate) fn max_idx(&self) -> usize {
        self.max_idx.load(Ordering::Relaxed)
    }

    /// Number of live slots.
    pub(crate) fn live(&self) -> usize {
        self.nthread.load(Ordering::Relaxed)
    }

    pub(crate) fn slot(&self, idx: usize) -> &Slot {
        &self.slots[idx]
    }

    /// Hands every retired ring to `f` for a final drain and disposal.
    /// Only the logger (or the shutdown path after joining it) may call
    /// this; retired rings may still be referenced by an in-flight logger
    /// sweep otherwise.
    pub(crate) fn take_retired(&self) -> Vec<Box<EventRing>> {
        core::mem::take(&mut *self.retired.lock())
    }
}

static REGISTRY: Registry = Registry::new();

/// The process-wide registry.
pub(crate) fn registry() -> &'static Registry {
    &REGISTRY
}

std::thread_local! {
    /// The calling thread's slot index in the process-wide registry.
    static CURRENT: Cell<Option<usize>> = const { Cell::new(None) };
}

pub(crate) fn set_current_slot(idx: Option<usize>) {
    CURRENT.with(|c| c.set(idx));
}

pub(crate) fn current_slot() -> Option<usize> {
    CURRENT.with(|c| c.get())
}

/// Runs `f` with the calling thread's slot and ring, if registered.
pub(crate) fn with_current<R>(f: impl FnOnce(&Slot, &EventRing) -> R) -> Option<R> {
    let idx = current_slot()?;
    let slot = registry().slot(idx);
    let ring = slot.ring_ptr();
    if ring.is_null() {
        return None;
    }
    // SAFETY: The calling thread owns this slot; its ring is not retired
    // until the thread itself releases the slot.
    Some(f(slot, unsafe { &*ring }))
}
