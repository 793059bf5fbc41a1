//! The drain thread.
//!
//! The logger owns the on-disk event log outright. It captures the process
//! memory map once at startup (for offline symbolization of raw instruction
//! pointers), then loops over every registered ring, the monitor's ring, and
//! the rings of exited threads, writing each contiguous readable run with a
//! single bulk write. When every ring is empty it simply goes around again;
//! it is expected to own a core. Retired rings are dropped here after their
//! final drain, which is why exiting threads never free ring memory
//! themselves.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config;
use crate::event::{records_as_bytes, EventRing};
use crate::init;
use crate::monitor;
use crate::registry::{self, Registry};

static RESET: AtomicBool = AtomicBool::new(false);

/// Asks the logger to truncate the log on its next pass.
pub(crate) fn request_reset() {
    RESET.store(true, Ordering::Relaxed);
}

fn take_reset() -> bool {
    RESET.swap(false, Ordering::Relaxed)
}

/// Copies the process memory map to the sidecar file.
fn capture_maps(path: &Path) {
    match fs::read("/proc/self/maps") {
        Ok(maps) => {
            if let Err(err) = fs::write(path, maps) {
                log::error!(target: "ldb::logger", "writing {:?}: {}", path, err);
            }
        }
        Err(err) => {
            log::error!(target: "ldb::logger", "reading /proc/self/maps: {}", err);
        }
    }
}

/// Opens (truncating) the event log, degrading to a sink on failure so the
/// rings keep draining and the application is never disturbed.
fn open_log(path: &Path) -> Box<dyn Write> {
    match File::create(path) {
        Ok(file) => Box::new(file),
        Err(err) => {
            log::error!(target: "ldb::logger", "creating {:?}: {}", path, err);
            Box::new(io::sink())
        }
    }
}

/// Drains one ring into `out`, one bulk write per contiguous run.
///
/// # Safety
///
/// The caller must be the ring's sole consumer.
unsafe fn drain_ring<W: Write + ?Sized>(ring: &EventRing, out: &mut W) -> io::Result<usize> {
    let mut result = Ok(());
    let consumed = ring.consume(|run| {
        if result.is_ok() {
            result = out.write_all(records_as_bytes(run));
        }
    });
    result.map(|()| consumed)
}

/// Drains every live ring, the monitor ring, and the retired rings into
/// `out`, disposing of retired rings afterwards. Returns how many records
/// were written.
pub(crate) fn sweep<W: Write + ?Sized>(
    reg: &Registry,
    extra: Option<&EventRing>,
    out: &mut W,
) -> io::Result<usize> {
    let mut written = 0;
    for idx in 0..reg.max_idx() {
        let ring = reg.slot(idx).ring_ptr();
        if ring.is_null() {
            continue;
        }
        // SAFETY: The logger is the sole consumer, and a ring reached
        // through a slot stays alive even if its thread exits concurrently:
        // release only moves it to the retired list, which is disposed of
        // below, on this same thread.
        written += unsafe { drain_ring(&*ring, out)? };
    }
    if let Some(ring) = extra {
        // SAFETY: As above; the monitor ring lives for the process.
        written += unsafe { drain_ring(ring, out)? };
    }
    for ring in reg.take_retired() {
        // SAFETY: Retired rings have no producer anymore and this is their
        // final drain before they are dropped.
        written += unsafe { drain_ring(&ring, out)? };
        let ignored = ring.ignored();
        if ignored > 0 {
            log::debug!(
                target: "ldb::logger",
                "retired ring dropped {} records over its lifetime",
                ignored
            );
        }
    }
    Ok(written)
}

/// Entry point of the logger thread.
pub(crate) fn logger_main() {
    let cfg = config::get();
    if let Some(cpu) = cfg.logger_cpu {
        init::pin_to_cpu("logger", cpu);
    }
    log::info!(target: "ldb::logger", "logger thread starts");

    capture_maps(&cfg.maps_output);
    let mut out = open_log(&cfg.output);

    while init::running() {
        if take_reset() {
            out = open_log(&cfg.output);
        }
        if let Err(err) = sweep(registry::registry(), monitor::ring(), &mut *out) {
            log::error!(target: "ldb::logger", "writing event log: {}", err);
        }
    }

    // One final pass so everything acknowledged before shutdown is on disk.
    if let Err(err) = sweep(registry::registry(), monitor::ring(), &mut *out) {
        log::error!(target: "ldb::logger", "writing event log: {}", err);
    }
    if let Err(err) = out.flush() {
        log::error!(target: "ldb::logger", "flushing event log: {}", err);
    }

    log::info!(target: "ldb::logger", "logger thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, EventRecord};

    fn decode(bytes: &[u8]) -> Vec<EventRecord> {
        assert_eq!(bytes.len() % 40, 0);
        bytes
            .chunks_exact(40)
            .map(|c| EventRecord {
                kind: u32::from_le_bytes(c[0..4].try_into().unwrap()),
                sec: u32::from_le_bytes(c[4..8].try_into().unwrap()),
                nsec: u32::from_le_bytes(c[8..12].try_into().unwrap()),
                tid: u32::from_le_bytes(c[12..16].try_into().unwrap()),
                arg1: u64::from_le_bytes(c[16..24].try_into().unwrap()),
                arg2: u64::from_le_bytes(c[24..32].try_into().unwrap()),
                arg3: u64::from_le_bytes(c[32..40].try_into().unwrap()),
            })
            .collect()
    }

    fn record(i: u64) -> EventRecord {
        EventRecord::at(EventKind::TagSet, i * 1_000_000_007, 9, i, 2 * i, 3 * i)
    }

    #[test]
    fn sweep_writes_live_and_monitor_rings() {
        let reg = Registry::new();
        let mut tls = 0_u64;
        let idx = reg
            .acquire(9, &mut tls, &tls as *const u64 as usize, Box::new(EventRing::new(16)))
            .unwrap();
        let thread_ring = reg.slot(idx).ring_ptr();
        for i in 0..4 {
            unsafe { (*thread_ring).push(record(i)) };
        }
        let mon = EventRing::new(16);
        for i in 10..12 {
            unsafe { mon.push(record(i)) };
        }

        let mut out = Vec::new();
        let written = sweep(&reg, Some(&mon), &mut out).unwrap();
        assert_eq!(written, 6);
        let records = decode(&out);
        assert_eq!(records.len(), 6);
        assert_eq!(records[0], record(0));
        assert_eq!(records[4], record(10));

        // Nothing left: the next sweep writes nothing.
        let mut out2 = Vec::new();
        assert_eq!(sweep(&reg, Some(&mon), &mut out2).unwrap(), 0);
        assert!(out2.is_empty());

        reg.release(idx);
        drop(reg.take_retired());
    }

    #[test]
    fn shutdown_flush_includes_retired_rings() {
        let reg = Registry::new();
        let mut tls = 0_u64;
        let idx = reg
            .acquire(5, &mut tls, &tls as *const u64 as usize, Box::new(EventRing::new(16)))
            .unwrap();
        let thread_ring = reg.slot(idx).ring_ptr();
        for i in 0..3 {
            unsafe { (*thread_ring).push(record(i)) };
        }
        // The thread exits before the logger ever saw its events.
        reg.release(idx);

        let mut out = Vec::new();
        let written = sweep(&reg, None, &mut out).unwrap();
        assert_eq!(written, 4);
        let records = decode(&out);
        assert_eq!(records[0], record(0));
        // The final record is the thread-exit marker posted at release.
        assert_eq!(records[3].kind, EventKind::ThreadExit as u32);
        assert_eq!(records[3].tid, 5);
    }

    #[test]
    fn reset_flag_is_one_shot() {
        assert!(!take_reset());
        request_reset();
        assert!(take_reset());
        assert!(!take_reset());
    }

    #[test]
    fn maps_sidecar_is_verbatim() {
        let path = std::env::temp_dir().join(format!("ldb-maps-test-{}", std::process::id()));
        capture_maps(&path);
        let written = fs::read(&path).unwrap();
        assert!(!written.is_empty());
        // Every line of a maps dump starts with a hex address range.
        let first = std::str::from_utf8(&written).unwrap().lines().next().unwrap();
        assert!(first.contains('-'));
        fs::remove_file(&path).unwrap();
    }
}
