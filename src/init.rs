//! Process init and exit.
//!
//! `init` is one-shot: it loads the configuration, registers the main
//! thread (seeding its outermost frame via the instrumentation's TLS
//! checkpoint), starts the monitor and logger threads with interposition
//! suppressed so they are never registered themselves, and arranges for a
//! graceful stop at process exit. Setup failures are logged and degrade the
//! telemetry; they never surface into the application.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Once, PoisonError};
use std::thread::JoinHandle;

use rustix::thread::{sched_setaffinity, CpuSet};

use crate::layout;
use crate::shim::{self, FrameSeed, Seed};
use crate::{arch, config, logger, monitor};

static RUNNING: AtomicBool = AtomicBool::new(false);

/// Whether the infrastructure threads should keep going.
pub(crate) fn running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

struct Infra {
    monitor: Option<JoinHandle<()>>,
    logger: Option<JoinHandle<()>>,
    main_slot: Option<usize>,
}

static INFRA: Mutex<Infra> = Mutex::new(Infra {
    monitor: None,
    logger: None,
    main_slot: None,
});

static STARTED: Once = Once::new();

/// Starts the profiler: registers the calling (main) thread, launches the
/// monitor and logger threads, and installs an exit handler that stops them.
/// Call once from the instrumented program's `main`; later calls are no-ops.
pub fn init() {
    STARTED.call_once(startup);
}

fn startup() {
    #[cfg(feature = "env_logger")]
    let _ = env_logger::try_init();

    let cfg = config::get();
    monitor::init_ring(cfg.ring_capacity);

    // Seed main's outermost frame. The instrumentation checkpointed main's
    // frame pointer into the TLS on entry; if what is there does not look
    // like a frame on this stack, this is not an instrumented build, and
    // main is registered without touching the TLS words.
    let fp = arch::tls_current_fp();
    let main_slot = if layout::plausible_stack_fp(fp) {
        shim::register_current_thread(Seed::InstrumentedCheckpoint { fp })
    } else {
        log::debug!(
            target: "ldb::init",
            "TLS checkpoint {:#x} is not a stack address; stack observation disabled for main",
            fp
        );
        let seed: &'static mut FrameSeed = Box::leak(Box::new(FrameSeed::new()));
        shim::register_current_thread(Seed::Detached {
            frame: seed.as_mut_ptr(),
        })
    };

    RUNNING.store(true, Ordering::Relaxed);

    let (monitor_thread, logger_thread) = shim::with_interposition_suppressed(|| {
        let monitor_thread = std::thread::Builder::new()
            .name("ldb-monitor".into())
            .spawn(monitor::monitor_main);
        let logger_thread = std::thread::Builder::new()
            .name("ldb-logger".into())
            .spawn(logger::logger_main);
        (monitor_thread, logger_thread)
    });

    let mut infra = INFRA.lock().unwrap_or_else(PoisonError::into_inner);
    infra.main_slot = main_slot;
    match monitor_thread {
        Ok(handle) => infra.monitor = Some(handle),
        Err(err) => log::error!(target: "ldb::init", "spawning monitor: {}", err),
    }
    match logger_thread {
        Ok(handle) => infra.logger = Some(handle),
        Err(err) => log::error!(target: "ldb::init", "spawning logger: {}", err),
    }
    drop(infra);

    extern "C" fn exit_handler() {
        shutdown();
    }
    // SAFETY: `atexit` just records a function pointer.
    if unsafe { libc::atexit(exit_handler) } != 0 {
        log::warn!(target: "ldb::init", "atexit registration failed; call shutdown() explicitly");
    }

    log::info!(target: "ldb::init", "profiler started");
}

/// Stops the profiler: releases the main thread's slot, signals the
/// infrastructure threads, and joins them. The logger performs a final
/// sweep before exiting, so every event acknowledged before this returns is
/// in the log. Installed as an exit handler by [`init`]; call it explicitly
/// (from the main thread) to stop earlier.
pub fn shutdown() {
    let mut infra = INFRA.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(idx) = infra.main_slot.take() {
        shim::unregister_current_thread(idx);
    }
    RUNNING.store(false, Ordering::Relaxed);
    if let Some(handle) = infra.monitor.take() {
        let _ = handle.join();
    }
    if let Some(handle) = infra.logger.take() {
        let _ = handle.join();
    }
    log::info!(target: "ldb::init", "profiler stopped");
}

/// Truncates the event log mid-run; subsequent events start a fresh file.
pub fn reset() {
    logger::request_reset();
}

/// Pins the calling thread to `cpu`, logging (not failing) on refusal.
pub(crate) fn pin_to_cpu(who: &str, cpu: usize) {
    let mut set = CpuSet::new();
    set.set(cpu);
    match sched_setaffinity(None, &set) {
        Ok(()) => log::debug!(target: "ldb::init", "{} pinned to CPU {}", who, cpu),
        Err(err) => {
            log::warn!(target: "ldb::init", "pinning {} to CPU {}: {}", who, cpu, err)
        }
    }
}

/// C ABI entry points for instrumented applications.
#[cfg(feature = "interpose")]
mod cabi {
    #[no_mangle]
    extern "C" fn __ldb_init() {
        super::init();
    }

    #[no_mangle]
    extern "C" fn __ldb_exit() {
        super::shutdown();
    }
}

/// Run `init` before `main`.
#[cfg(feature = "init-array")]
#[link_section = ".init_array.00099"]
#[used]
static INIT_ARRAY: unsafe extern "C" fn() = {
    unsafe extern "C" fn function() {
        init();
    }
    function
};
