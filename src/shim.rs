//! The interposition shim.
//!
//! Thread lifecycle and registration live here: the per-thread startup
//! wrapper seeds the outermost frame and TLS words, allocates the event
//! ring, and claims a registry slot before the user's work function runs;
//! the reverse happens on the way out. With the `interpose` feature the
//! module also exports `pthread_*` wrappers at the binary-symbol level,
//! each delegating to the real implementation resolved once via
//! `dlsym(RTLD_NEXT)`. Interposition is purely telemetry: a resolution
//! failure disables that one wrapper, and nothing here is ever allowed to
//! perturb the application beyond an error return the real call could have
//! produced anyway.

use core::cell::Cell;

use crate::arch;
use crate::config;
use crate::event::{self, EventKind, EventRing};
use crate::layout;
use crate::registry;
use crate::time;

/// Backing store for a fabricated outermost frame.
#[repr(C, align(8))]
pub(crate) struct FrameSeed([u64; 4]);

impl FrameSeed {
    pub(crate) const fn new() -> Self {
        Self([0; 4])
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut u64 {
        self.0.as_mut_ptr()
    }
}

/// How a thread's outermost frame and TLS words are prepared at
/// registration.
#[cfg_attr(not(feature = "interpose"), allow(dead_code))]
pub(crate) enum Seed {
    /// The TLS checkpoint already points at an instrumented outermost frame
    /// (main, in an instrumented build): seed it in place so the walk
    /// terminates there.
    InstrumentedCheckpoint {
        /// The checkpoint frame pointer.
        fp: usize,
    },
    /// Point the TLS words at a fabricated outermost frame (start of an
    /// interposed thread, before any instrumented code has run).
    Fresh {
        /// The fabricated frame.
        frame: *mut u64,
    },
    /// Leave the TLS words alone entirely (uninstrumented process): sync
    /// and tag telemetry still work, stack observation self-disables
    /// because nothing on the stack ever carries a canary.
    Detached {
        /// The fabricated frame; doubles as the stack base.
        frame: *mut u64,
    },
}

/// The calling thread's OS thread id.
pub(crate) fn current_tid() -> u32 {
    rustix::thread::gettid().as_raw_nonzero().get() as u32
}

/// Registers the calling thread: prepares the outermost frame per `seed`,
/// allocates its event ring, claims a registry slot, and posts the
/// thread-create event. Returns the slot, or `None` when the table is full
/// (telemetry for this thread degrades to nothing).
pub(crate) fn register_current_thread(seed: Seed) -> Option<usize> {
    let cfg = config::get();
    let tid = current_tid();

    let (stack_base, own_tls) = match seed {
        Seed::InstrumentedCheckpoint { fp } => {
            // SAFETY: The caller validated `fp` as a plausible instrumented
            // frame on this stack; the handshake region exists in this
            // build.
            unsafe {
                layout::seed_outermost_frame(fp as *mut u64);
                arch::tls_set_canary_tag(layout::canary_word());
            }
            (fp, true)
        }
        Seed::Fresh { frame } => {
            // SAFETY: `frame` is caller-owned seed storage, and the
            // handshake region is reserved in instrumented builds.
            unsafe {
                layout::seed_outermost_frame(frame);
                arch::tls_set_generation(0);
                arch::tls_set_canary_tag(layout::canary_word());
                arch::tls_set_current_fp(frame as usize);
            }
            (frame as usize, true)
        }
        Seed::Detached { frame } => {
            // SAFETY: `frame` is caller-owned seed storage.
            unsafe { layout::seed_outermost_frame(frame) };
            (frame as usize, false)
        }
    };

    let ring = Box::new(EventRing::new(cfg.ring_capacity));
    let idx = registry::registry().acquire(tid, arch::thread_pointer(), stack_base, ring)?;
    if own_tls {
        // SAFETY: The handshake region is reserved in this build (checked
        // or guaranteed by the seed mode above).
        unsafe { arch::tls_set_slot_index(idx as i32) };
    }
    registry::set_current_slot(Some(idx));
    OWN_TLS.with(|c| c.set(own_tls));
    event::post(EventKind::ThreadCreate, tid as u64, 0, 0);
    log::debug!(target: "ldb::shim", "thread {} registered in slot {}", tid, idx);
    Some(idx)
}

/// Unregisters the calling thread; the slot is released and its ring
/// retired for a final drain by the logger.
pub(crate) fn unregister_current_thread(idx: usize) {
    registry::registry().release(idx);
    registry::set_current_slot(None);
    OWN_TLS.with(|c| c.set(false));
    log::debug!(target: "ldb::shim", "slot {} released", idx);
}

std::thread_local! {
    /// Set while this thread spawns infrastructure threads, so the
    /// `pthread_create` wrapper passes them through unobserved.
    static SUPPRESS: Cell<bool> = const { Cell::new(false) };

    /// Whether this thread's TLS handshake words are ours to write
    /// (false for threads registered detached).
    static OWN_TLS: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling thread's TLS handshake words may be written.
pub(crate) fn tls_words_owned() -> bool {
    OWN_TLS.with(|c| c.get())
}

/// Runs `f` with thread-creation interposition suppressed on this thread.
pub(crate) fn with_interposition_suppressed<R>(f: impl FnOnce() -> R) -> R {
    SUPPRESS.with(|s| s.set(true));
    let result = f();
    SUPPRESS.with(|s| s.set(false));
    result
}

#[cfg_attr(not(feature = "interpose"), allow(dead_code))]
fn suppressed() -> bool {
    SUPPRESS.with(|s| s.get())
}

/// Whether a mutex interval is loud enough to record. Quiet locks are
/// suppressed wholesale so the profiler can stay always-on.
pub(crate) fn should_emit_mutex(wait_ns: u64, hold_ns: u64, thresh_ns: u64) -> bool {
    wait_ns >= thresh_ns || hold_ns >= thresh_ns
}

/// Stamps the start of a mutex acquisition into the thread's slot.
#[cfg_attr(not(feature = "interpose"), allow(dead_code))]
pub(crate) fn mutex_wait_begins() {
    if let Some(idx) = registry::current_slot() {
        registry::registry().slot(idx).set_ts_wait(time::now_ns());
    }
}

/// Stamps a successful mutex acquisition into the thread's slot.
#[cfg_attr(not(feature = "interpose"), allow(dead_code))]
pub(crate) fn mutex_acquired() {
    if let Some(idx) = registry::current_slot() {
        registry::registry().slot(idx).set_ts_lock(time::now_ns());
    }
}

/// After a successful unlock: emits the wait/lock/unlock triple, stamped
/// with the recorded timestamps, if either the wait or the hold interval
/// reached the threshold.
pub(crate) fn mutex_unlocked(mutex_addr: u64) {
    let Some(idx) = registry::current_slot() else {
        return;
    };
    let slot = registry::registry().slot(idx);
    let now = time::now_ns();
    let ts_wait = slot.ts_wait();
    let ts_lock = slot.ts_lock();
    let wait = ts_lock.saturating_sub(ts_wait);
    let hold = now.saturating_sub(ts_lock);
    if should_emit_mutex(wait, hold, config::get().mutex_thresh_ns) {
        event::post_at(EventKind::MutexWait, ts_wait, mutex_addr, 0, 0);
        event::post_at(EventKind::MutexLock, ts_lock, mutex_addr, 0, 0);
        event::post_at(EventKind::MutexUnlock, now, mutex_addr, 0, 0);
    }
}

/// The symbol wrappers. Everything delegates; telemetry rides alongside.
#[cfg(feature = "interpose")]
mod wrappers {
    use core::ffi::c_void;
    use core::sync::atomic::{AtomicPtr, Ordering};

    use libc::{c_int, pthread_attr_t, pthread_cond_t, pthread_mutex_t, pthread_t, timespec};

    use super::{suppressed, FrameSeed, Seed};
    use crate::event::{self, EventKind};

    type StartRoutine = unsafe extern "C" fn(*mut c_void) -> *mut c_void;
    type PthreadCreateFn = unsafe extern "C" fn(
        *mut pthread_t,
        *const pthread_attr_t,
        StartRoutine,
        *mut c_void,
    ) -> c_int;
    type PthreadJoinFn = unsafe extern "C" fn(pthread_t, *mut *mut c_void) -> c_int;
    type MutexFn = unsafe extern "C" fn(*mut pthread_mutex_t) -> c_int;
    type CondWaitFn = unsafe extern "C" fn(*mut pthread_cond_t, *mut pthread_mutex_t) -> c_int;
    type CondTimedwaitFn = unsafe extern "C" fn(
        *mut pthread_cond_t,
        *mut pthread_mutex_t,
        *const timespec,
    ) -> c_int;

    /// Resolves and caches the next definition of a symbol. `name` must be
    /// nul-terminated.
    unsafe fn real(cache: &AtomicPtr<c_void>, name: &'static str) -> *mut c_void {
        debug_assert!(name.ends_with('\0'));
        let cached = cache.load(Ordering::Relaxed);
        if !cached.is_null() {
            return cached;
        }
        let sym = libc::dlsym(libc::RTLD_NEXT, name.as_ptr().cast());
        if sym.is_null() {
            log::error!(
                target: "ldb::shim",
                "dlsym(RTLD_NEXT, {}) failed; this interposition is disabled",
                &name[..name.len() - 1]
            );
        } else {
            cache.store(sym, Ordering::Relaxed);
        }
        sym
    }

    struct StartParams {
        start: StartRoutine,
        arg: *mut c_void,
    }

    /// The per-thread startup wrapper every interposed thread runs instead
    /// of its start routine.
    unsafe extern "C" fn thread_start(arg: *mut c_void) -> *mut c_void {
        let params = Box::from_raw(arg.cast::<StartParams>());
        let mut seed = FrameSeed::new();
        let idx = super::register_current_thread(Seed::Fresh {
            frame: seed.as_mut_ptr(),
        });
        let ret = (params.start)(params.arg);
        if let Some(idx) = idx {
            super::unregister_current_thread(idx);
        }
        ret
    }

    #[no_mangle]
    unsafe extern "C" fn pthread_create(
        thread: *mut pthread_t,
        attr: *const pthread_attr_t,
        start: StartRoutine,
        arg: *mut c_void,
    ) -> c_int {
        static REAL: AtomicPtr<c_void> = AtomicPtr::new(core::ptr::null_mut());
        let sym = real(&REAL, "pthread_create\0");
        if sym.is_null() {
            return libc::EAGAIN;
        }
        let real: PthreadCreateFn = core::mem::transmute(sym);
        if suppressed() {
            return real(thread, attr, start, arg);
        }
        let params = Box::into_raw(Box::new(StartParams { start, arg }));
        let ret = real(thread, attr, thread_start, params.cast());
        if ret != 0 {
            drop(Box::from_raw(params));
        }
        ret
    }

    #[no_mangle]
    unsafe extern "C" fn pthread_join(thread: pthread_t, retval: *mut *mut c_void) -> c_int {
        static REAL: AtomicPtr<c_void> = AtomicPtr::new(core::ptr::null_mut());
        let sym = real(&REAL, "pthread_join\0");
        if sym.is_null() {
            return libc::EINVAL;
        }
        let real: PthreadJoinFn = core::mem::transmute(sym);
        event::post(EventKind::JoinWait, thread as u64, 0, 0);
        let ret = real(thread, retval);
        if ret == 0 {
            event::post(EventKind::JoinJoined, thread as u64, 0, 0);
        }
        ret
    }

    #[no_mangle]
    unsafe extern "C" fn pthread_mutex_lock(mutex: *mut pthread_mutex_t) -> c_int {
        static REAL: AtomicPtr<c_void> = AtomicPtr::new(core::ptr::null_mut());
        let sym = real(&REAL, "pthread_mutex_lock\0");
        if sym.is_null() {
            return libc::EINVAL;
        }
        let real: MutexFn = core::mem::transmute(sym);
        super::mutex_wait_begins();
        let ret = real(mutex);
        if ret == 0 {
            super::mutex_acquired();
        }
        ret
    }

    #[no_mangle]
    unsafe extern "C" fn pthread_mutex_trylock(mutex: *mut pthread_mutex_t) -> c_int {
        static REAL: AtomicPtr<c_void> = AtomicPtr::new(core::ptr::null_mut());
        let sym = real(&REAL, "pthread_mutex_trylock\0");
        if sym.is_null() {
            return libc::EINVAL;
        }
        let real: MutexFn = core::mem::transmute(sym);
        super::mutex_wait_begins();
        let ret = real(mutex);
        if ret == 0 {
            super::mutex_acquired();
        }
        ret
    }

    #[no_mangle]
    unsafe extern "C" fn pthread_mutex_unlock(mutex: *mut pthread_mutex_t) -> c_int {
        static REAL: AtomicPtr<c_void> = AtomicPtr::new(core::ptr::null_mut());
        let sym = real(&REAL, "pthread_mutex_unlock\0");
        if sym.is_null() {
            return libc::EINVAL;
        }
        let real: MutexFn = core::mem::transmute(sym);
        let ret = real(mutex);
        if ret == 0 {
            super::mutex_unlocked(mutex as usize as u64);
        }
        ret
    }

    #[no_mangle]
    unsafe extern "C" fn pthread_cond_wait(
        cond: *mut pthread_cond_t,
        mutex: *mut pthread_mutex_t,
    ) -> c_int {
        static REAL: AtomicPtr<c_void> = AtomicPtr::new(core::ptr::null_mut());
        let sym = real(&REAL, "pthread_cond_wait\0");
        if sym.is_null() {
            return libc::EINVAL;
        }
        let real: CondWaitFn = core::mem::transmute(sym);
        // The real wait re-acquires `mutex` internally, bypassing the lock
        // wrapper; refresh the timestamps here so the eventual unlock
        // attributes the wait to the condition variable sleep.
        super::mutex_wait_begins();
        let ret = real(cond, mutex);
        super::mutex_acquired();
        ret
    }

    #[no_mangle]
    unsafe extern "C" fn pthread_cond_timedwait(
        cond: *mut pthread_cond_t,
        mutex: *mut pthread_mutex_t,
        abstime: *const timespec,
    ) -> c_int {
        static REAL: AtomicPtr<c_void> = AtomicPtr::new(core::ptr::null_mut());
        let sym = real(&REAL, "pthread_cond_timedwait\0");
        if sym.is_null() {
            return libc::EINVAL;
        }
        let real: CondTimedwaitFn = core::mem::transmute(sym);
        super::mutex_wait_begins();
        let ret = real(cond, mutex, abstime);
        // The mutex is re-acquired on every return path, timeout included.
        super::mutex_acquired();
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventRecord;

    #[test]
    fn mutex_threshold_is_or_combined() {
        assert!(!should_emit_mutex(0, 0, 1000));
        assert!(!should_emit_mutex(999, 999, 1000));
        assert!(should_emit_mutex(1000, 0, 1000));
        assert!(should_emit_mutex(0, 1000, 1000));
        assert!(should_emit_mutex(5000, 5000, 1000));
    }

    fn drain_own_ring() -> Vec<EventRecord> {
        let mut events = Vec::new();
        registry::with_current(|_, ring| {
            // SAFETY: No logger is running in tests; this thread is the
            // sole consumer of its own ring.
            unsafe { ring.consume(|run| events.extend_from_slice(run)) };
        });
        events
    }

    #[test]
    fn detached_registration_posts_lifecycle_and_mutex_events() {
        let mut seed = FrameSeed::new();
        let idx = register_current_thread(Seed::Detached {
            frame: seed.as_mut_ptr(),
        })
        .unwrap();
        let tid = current_tid();

        let events = drain_own_ring();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::ThreadCreate as u32);
        assert_eq!(events[0].tid, tid);
        assert_eq!(events[0].arg1, tid as u64);

        // A loud mutex: the wait began long ago, so the triple is emitted
        // with the stamped timestamps in order.
        let slot = registry::registry().slot(idx);
        let now = time::now_ns();
        slot.set_ts_wait(now - 50_000);
        slot.set_ts_lock(now - 25_000);
        mutex_unlocked(0xbeef);
        let events = drain_own_ring();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, EventKind::MutexWait as u32);
        assert_eq!(events[1].kind, EventKind::MutexLock as u32);
        assert_eq!(events[2].kind, EventKind::MutexUnlock as u32);
        assert!(events.iter().all(|e| e.arg1 == 0xbeef));

        unregister_current_thread(idx);
        assert!(registry::current_slot().is_none());

        // Unregistered: everything degrades to a silent no-op.
        mutex_unlocked(0xbeef);
        assert!(drain_own_ring().is_empty());
        drop(registry::registry().take_retired());
    }

    #[test]
    fn suppression_is_scoped() {
        assert!(!suppressed());
        let r = with_interposition_suppressed(|| {
            assert!(suppressed());
            17
        });
        assert_eq!(r, 17);
        assert!(!suppressed());
    }
}
