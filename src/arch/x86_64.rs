//! x86_64 access to the thread-pointer-relative handshake words.
//!
//! On x86_64 the platform thread-pointer register is `fs`, and a copy of the
//! thread pointer is stored at the memory location it points to (reading
//! `fs:0` is much cheaper than `rdfsbase` and needs no CPU feature bits).
//! The instrumentation reserves the words immediately below the thread
//! pointer; see [`crate::layout`] for their meaning. All accessors here
//! operate on the *current* thread's words. The monitor reads other threads'
//! words through the registry's published thread-pointer instead.

use core::arch::asm;

/// Returns the current thread's thread pointer (fs base).
#[inline]
pub(crate) fn thread_pointer() -> *mut u64 {
    let tp: u64;
    // SAFETY: The x86_64 TLS ABI stores a copy of the thread pointer at the
    // address the thread pointer points to.
    unsafe {
        asm!(
            "mov {}, qword ptr fs:[0]",
            out(reg) tp,
            options(nostack, preserves_flags),
        );
    }
    tp as *mut u64
}

/// Reads the checkpoint frame pointer word (`fs:-8`).
#[inline]
pub(crate) fn tls_current_fp() -> usize {
    let fp: u64;
    // SAFETY: Loads a word from the reserved handshake region.
    unsafe {
        asm!(
            "mov {}, qword ptr fs:[-8]",
            out(reg) fp,
            options(nostack, preserves_flags),
        );
    }
    fp as usize
}

/// Writes the checkpoint frame pointer word (`fs:-8`).
///
/// # Safety
///
/// The calling thread's handshake region must be reserved for this crate's
/// use (instrumented build, or a thread set up by the startup wrapper).
#[inline]
pub(crate) unsafe fn tls_set_current_fp(fp: usize) {
    asm!(
        "mov qword ptr fs:[-8], {}",
        in(reg) fp as u64,
        options(nostack, preserves_flags),
    );
}

/// Writes the generation counter word (`fs:-16`).
///
/// # Safety
///
/// As [`tls_set_current_fp`].
#[inline]
pub(crate) unsafe fn tls_set_generation(generation: u64) {
    asm!(
        "mov qword ptr fs:[-16], {}",
        in(reg) generation,
        options(nostack, preserves_flags),
    );
}

/// Reads the combined canary/tag word (`fs:-24`).
#[inline]
pub(crate) fn tls_canary_tag() -> u64 {
    let word: u64;
    // SAFETY: Loads a word from the reserved handshake region.
    unsafe {
        asm!(
            "mov {}, qword ptr fs:[-24]",
            out(reg) word,
            options(nostack, preserves_flags),
        );
    }
    word
}

/// Writes the combined canary/tag word (`fs:-24`).
///
/// # Safety
///
/// As [`tls_set_current_fp`].
#[inline]
pub(crate) unsafe fn tls_set_canary_tag(word: u64) {
    asm!(
        "mov qword ptr fs:[-24], {}",
        in(reg) word,
        options(nostack, preserves_flags),
    );
}

/// Writes the registry slot index word (`fs:-32`).
///
/// # Safety
///
/// As [`tls_set_current_fp`].
#[inline]
pub(crate) unsafe fn tls_set_slot_index(index: i32) {
    asm!(
        "mov dword ptr fs:[-32], {:e}",
        in(reg) index,
        options(nostack, preserves_flags),
    );
}
