//! The stack observer.
//!
//! One dedicated thread scans every registered stack in a tight loop. For
//! each thread it keeps persistent bookkeeping: the frames seen last time,
//! each with the wall-clock latency accumulated since it was first sighted.
//! A scan walks the live stack (validated by the TLS sequence lock and the
//! per-frame canary), then diffs the fresh frames against the bookkeeping:
//! frames whose generation still matches are the same invocation and accrue
//! the inter-scan elapsed time; frames that disappeared have returned and
//! are emitted as stack events with their accumulated latency; frames that
//! appeared are recorded with latency zero.
//!
//! Stack events go into the monitor's own dedicated ring, drained by the
//! logger like any thread ring. Scans that race with the observed thread
//! are discarded whole; the monitor never blocks and never aborts the
//! process.

use std::sync::OnceLock;
use std::time::Duration;

use crate::config;
use crate::event::{EventKind, EventRecord, EventRing};
use crate::init;
use crate::layout::MAX_CALLDEPTH;
use crate::registry::{self, Registry, MAX_THREADS};
use crate::stack::{self, RawFrame, RemoteThread, SeqLock, WalkEnd};
use crate::time;

/// A frame under observation, with its latency accumulated so far.
#[derive(Clone, Debug)]
pub(crate) struct LiveFrame {
    pub(crate) generation: u64,
    pub(crate) fp: usize,
    pub(crate) rip: u64,
    /// Tag at last sighting, kept for diagnostics.
    pub(crate) tag: u32,
    pub(crate) latency_ns: u64,
}

impl From<RawFrame> for LiveFrame {
    fn from(f: RawFrame) -> Self {
        Self {
            generation: f.generation,
            fp: f.fp,
            rip: f.rip,
            tag: f.tag,
            latency_ns: 0,
        }
    }
}

/// Per-thread bookkeeping between scans.
struct Book {
    /// Tid the frames belong to; a slot reclaimed by another thread resets
    /// the book so stale frames are never reported against the newcomer.
    tid: u32,
    /// Baseline for the next scan's elapsed time, nanoseconds.
    last_ts: u64,
    /// Sequence-lock value at the last good scan; unchanged means the
    /// thread made no progress and the scan can be skipped outright.
    last_seq: Option<SeqLock>,
    /// Observed frames, outermost first.
    frames: Vec<LiveFrame>,
}

impl Book {
    const fn new() -> Self {
        Self {
            tid: 0,
            last_ts: 0,
            last_seq: None,
            frames: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.tid = 0;
        self.last_ts = 0;
        self.last_seq = None;
        self.frames.clear();
    }
}

/// Scanning state for all slots.
pub(crate) struct Monitor {
    books: Vec<Book>,
    scratch: Vec<RawFrame>,
    completed: Vec<LiveFrame>,
}

impl Monitor {
    pub(crate) fn new() -> Self {
        Self {
            books: (0..MAX_THREADS).map(|_| Book::new()).collect(),
            scratch: Vec::with_capacity(MAX_CALLDEPTH),
            completed: Vec::new(),
        }
    }

    /// Scans every registered thread once.
    pub(crate) fn scan(&mut self, reg: &Registry, out: &EventRing) {
        for idx in 0..reg.max_idx() {
            self.scan_slot(reg, idx, out);
        }
    }

    fn scan_slot(&mut self, reg: &Registry, idx: usize, out: &EventRing) {
        let slot = reg.slot(idx);
        let book = &mut self.books[idx];

        let Some(remote) = RemoteThread::new(slot.tls_word(), slot.stack_base()) else {
            // Slot free or thread gone; its unfinished frames never
            // completed, so they are dropped without emission.
            book.reset();
            return;
        };
        let tid = slot.tid();
        if book.tid != tid {
            book.reset();
            book.tid = tid;
        }

        let Some(start) = remote.seq() else {
            book.reset();
            return;
        };
        if book.last_seq == Some(start) {
            // No progress since the last scan; nothing to re-sample. The
            // baseline stays put so latency accrues across the gap.
            return;
        }

        let now = time::now_ns();
        if stack::walk(&remote, start, &mut self.scratch) == WalkEnd::Torn
            || remote.seq() != Some(start)
        {
            // The thread moved during the walk. Discard the scan, and make
            // the next good scan charge from here so the lost interval is
            // never charged twice.
            book.last_ts = now;
            return;
        }
        if self.scratch.is_empty() {
            return;
        }

        let elapsed = if book.frames.is_empty() {
            0
        } else {
            now.saturating_sub(book.last_ts)
        };
        diff(&mut book.frames, &self.scratch, elapsed, &mut self.completed);
        if book.frames.len() > MAX_CALLDEPTH {
            log::warn!(
                target: "ldb::monitor",
                "thread {} bookkeeping depth {} exceeds {}",
                tid,
                book.frames.len(),
                MAX_CALLDEPTH
            );
        }

        for frame in self.completed.drain(..) {
            log::trace!(
                target: "ldb::monitor",
                "thread {} completed generation {} (tag {}) after {}ns",
                tid,
                frame.generation,
                frame.tag,
                frame.latency_ns
            );
            let record = EventRecord::at(
                EventKind::Stack,
                now,
                tid,
                frame.latency_ns,
                frame.rip,
                frame.generation,
            );
            // SAFETY: The monitor thread is the sole producer for `out`.
            unsafe { out.push(record) };
        }

        book.last_seq = Some(start);
        book.last_ts = now;
    }
}

/// Diffs freshly walked frames (`fresh`, innermost first) against the
/// bookkeeping (`old`, outermost first).
///
/// Old frames lying above the fresh walk's outermost frame are beyond the
/// observed window (the walk stopped at a non-instrumented boundary); they
/// are retained and keep accruing rather than being reported as returned.
/// The matched prefix accrues `elapsed`; the remainder of `old` has
/// returned and is moved to `completed` (outermost first); unmatched fresh
/// frames join `old` with latency zero.
pub(crate) fn diff(
    old: &mut Vec<LiveFrame>,
    fresh: &[RawFrame],
    elapsed: u64,
    completed: &mut Vec<LiveFrame>,
) {
    completed.clear();
    debug_assert!(!fresh.is_empty());
    let outermost_fp = fresh[fresh.len() - 1].fp;

    let mut i = 0;
    while i < old.len() && old[i].fp > outermost_fp {
        old[i].latency_ns += elapsed;
        i += 1;
    }

    let mut j = fresh.len();
    while i < old.len() && j > 0 && old[i].generation == fresh[j - 1].generation {
        old[i].latency_ns += elapsed;
        i += 1;
        j -= 1;
    }

    completed.extend(old.drain(i..));

    while j > 0 {
        old.push(LiveFrame::from(fresh[j - 1]));
        j -= 1;
    }
}

static RING: OnceLock<EventRing> = OnceLock::new();

/// Creates the monitor's dedicated stack-event ring. One-shot.
pub(crate) fn init_ring(capacity: usize) {
    let _ = RING.set(EventRing::new(capacity));
}

/// The monitor's ring, once created.
pub(crate) fn ring() -> Option<&'static EventRing> {
    RING.get()
}

/// Entry point of the monitor thread.
pub(crate) fn monitor_main() {
    let cfg = config::get();
    if let Some(cpu) = cfg.monitor_cpu {
        init::pin_to_cpu("monitor", cpu);
    }
    let Some(out) = ring() else {
        return;
    };
    log::info!(target: "ldb::monitor", "monitor thread starts");

    let mut monitor = Monitor::new();
    let period = cfg.monitor_period_ns;
    while init::running() {
        let began = time::now_ns();
        monitor.scan(registry::registry(), out);
        if period > 0 {
            let elapsed = time::now_ns().saturating_sub(began);
            if elapsed < period {
                std::thread::sleep(Duration::from_nanos(period - elapsed));
            }
        }
    }

    log::info!(target: "ldb::monitor", "monitor thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::fixtures::FakeThread;

    fn raw(generation: u64, fp: usize) -> RawFrame {
        RawFrame {
            generation,
            fp,
            rip: 0x4000 + generation,
            tag: 0,
        }
    }

    fn live(generation: u64, fp: usize, latency_ns: u64) -> LiveFrame {
        LiveFrame {
            latency_ns,
            ..LiveFrame::from(raw(generation, fp))
        }
    }

    fn gens(frames: &[LiveFrame]) -> Vec<u64> {
        frames.iter().map(|f| f.generation).collect()
    }

    #[test]
    fn unchanged_stack_accrues_and_completes_nothing() {
        let mut old = vec![live(0, 1000, 5), live(1, 900, 5)];
        let mut completed = Vec::new();
        diff(&mut old, &[raw(1, 900), raw(0, 1000)], 7, &mut completed);
        assert!(completed.is_empty());
        assert_eq!(old[0].latency_ns, 12);
        assert_eq!(old[1].latency_ns, 12);
    }

    #[test]
    fn deeper_stack_adds_fresh_frames_at_zero() {
        let mut old = vec![live(0, 1000, 3)];
        let mut completed = Vec::new();
        diff(
            &mut old,
            &[raw(2, 800), raw(1, 900), raw(0, 1000)],
            4,
            &mut completed,
        );
        assert!(completed.is_empty());
        assert_eq!(gens(&old), vec![0, 1, 2]);
        assert_eq!(old[0].latency_ns, 7);
        assert_eq!(old[1].latency_ns, 0);
        assert_eq!(old[2].latency_ns, 0);
    }

    #[test]
    fn returned_frames_complete_with_accumulated_latency() {
        let mut old = vec![live(0, 1000, 9), live(1, 900, 9), live(3, 800, 6)];
        let mut completed = Vec::new();
        diff(&mut old, &[raw(1, 900), raw(0, 1000)], 2, &mut completed);
        assert_eq!(gens(&old), vec![0, 1]);
        assert_eq!(old[1].latency_ns, 11);
        // The completed frame kept the latency it had accumulated while
        // live; the interval in which it returned is not charged.
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].generation, 3);
        assert_eq!(completed[0].latency_ns, 6);
    }

    #[test]
    fn replaced_stack_completes_everything_old() {
        let mut old = vec![live(0, 1000, 4), live(1, 900, 2)];
        let mut completed = Vec::new();
        diff(&mut old, &[raw(5, 900), raw(4, 1000)], 3, &mut completed);
        assert_eq!(gens(&completed), vec![0, 1]);
        assert_eq!(gens(&old), vec![4, 5]);
        assert_eq!(old[0].latency_ns, 0);
    }

    #[test]
    fn truncated_walk_retains_frames_above_the_window() {
        let mut old = vec![live(0, 1000, 1), live(1, 900, 1), live(2, 800, 1)];
        let mut completed = Vec::new();
        // The walk only reached the innermost frame this time.
        diff(&mut old, &[raw(2, 800)], 5, &mut completed);
        assert!(completed.is_empty());
        assert_eq!(gens(&old), vec![0, 1, 2]);
        assert!(old.iter().all(|f| f.latency_ns == 6));
    }

    fn scan_setup(t: &FakeThread, base: usize, tid: u32) -> (Registry, usize) {
        let reg = Registry::new();
        let idx = reg
            .acquire(tid, t.tls_base(), base, Box::new(EventRing::new(64)))
            .unwrap();
        (reg, idx)
    }

    fn drain(out: &EventRing) -> Vec<EventRecord> {
        let mut events = Vec::new();
        // SAFETY: The test is the sole consumer.
        unsafe { out.consume(|run| events.extend_from_slice(run)) };
        events
    }

    #[test]
    fn idle_thread_emits_nothing_twice() {
        let mut t = FakeThread::new();
        let base = t.build_nested(480, 3);
        let (reg, _idx) = scan_setup(&t, base, 7);
        let out = EventRing::new(256);
        let mut m = Monitor::new();

        m.scan(&reg, &out);
        m.scan(&reg, &out);
        assert!(drain(&out).is_empty());
    }

    #[test]
    fn nested_call_and_return_emits_latency() {
        let mut t = FakeThread::new();
        let base = t.build_nested(480, 3);
        let (reg, _idx) = scan_setup(&t, base, 7);
        let out = EventRing::new(256);
        let mut m = Monitor::new();

        // Scan 1: three fresh frames, nothing completed.
        let before = time::now_ns();
        m.scan(&reg, &out);
        assert!(drain(&out).is_empty());

        std::thread::sleep(Duration::from_millis(2));

        // The thread calls one level deeper (generation 3).
        t.set_frame(432, t.addr_of(448), 3, 0x4003, 0);
        t.set_tls(3, t.addr_of(432));
        m.scan(&reg, &out);
        assert!(drain(&out).is_empty());

        // The two innermost frames return.
        t.set_tls(3, t.addr_of(464));
        m.scan(&reg, &out);
        let after = time::now_ns();

        let events = drain(&out);
        assert_eq!(events.len(), 2);
        // Outermost-first: generation 2 returned carrying the elapsed time
        // it was observed live (at least the 2ms sleep); generation 3 was
        // only ever sighted once, so it completes with zero latency.
        assert_eq!(events[0].kind, EventKind::Stack as u32);
        assert_eq!(events[0].tid, 7);
        assert_eq!(events[0].arg3, 2);
        assert_eq!(events[0].arg2, 0x4002);
        assert!(events[0].arg1 >= 2_000_000);
        assert!(events[0].arg1 <= after.saturating_sub(before));
        assert_eq!(events[1].arg3, 3);
        assert_eq!(events[1].arg1, 0);
    }

    #[test]
    fn reclaimed_slot_never_reports_stale_frames() {
        let mut t = FakeThread::new();
        let base = t.build_nested(480, 3);
        let (reg, idx) = scan_setup(&t, base, 7);
        let out = EventRing::new(256);
        let mut m = Monitor::new();

        m.scan(&reg, &out);
        reg.release(idx);
        m.scan(&reg, &out); // high-water is back to zero; nothing scanned

        // A different thread claims the same slot with its own stack.
        let mut t2 = FakeThread::new();
        let base2 = t2.build_nested(480, 2);
        let idx2 = reg
            .acquire(8, t2.tls_base(), base2, Box::new(EventRing::new(64)))
            .unwrap();
        assert_eq!(idx2, idx);
        m.scan(&reg, &out);
        assert!(drain(&out).is_empty());
        drop(reg.take_retired());
    }

    #[test]
    fn canary_truncation_does_not_fabricate_completions() {
        let mut t = FakeThread::new();
        let base = t.build_nested(480, 3);
        let (reg, _idx) = scan_setup(&t, base, 7);
        let out = EventRing::new(256);
        let mut m = Monitor::new();

        m.scan(&reg, &out);

        // A non-instrumented boundary appears mid-stack (the thread's
        // generation word moved, so the scan is not skipped).
        t.corrupt_canary(464);
        t.set_tls(3, t.addr_of(448));
        m.scan(&reg, &out);
        assert!(drain(&out).is_empty());

        // The boundary goes away again; everything still matches.
        t.set_frame(464, t.addr_of(480), 1, 0x4001, 0);
        t.set_tls(4, t.addr_of(448));
        m.scan(&reg, &out);
        assert!(drain(&out).is_empty());
    }
}
