//! The frame and TLS layout contract.
//!
//! This is the ABI between the compiler-assist instrumentation and the
//! monitor. The instrumentation must, for every function with a frame
//! pointer:
//!
//!  - on entry: increment the per-thread generation counter, store the new
//!    generation into both [`TLS_GENERATION`] and the frame's
//!    [`FRAME_GENERATION`] slot, zero the frame's tag half, keep the canary
//!    half constant, and checkpoint the frame pointer into
//!    [`TLS_CURRENT_FP`];
//!  - on return: restore the caller's frame pointer into [`TLS_CURRENT_FP`].
//!
//! Outermost frames (`main`, thread start) are seeded with generation 0,
//! canary set, and a null previous frame pointer, so walks terminate
//! cleanly. Non-instrumented frames carry no canary and end the walk.

/// Sentinel distinguishing instrumented frames from arbitrary stack bytes.
pub const CANARY: u32 = 0xDEAD_BEEF;

/// Frame slot offsets, in bytes relative to the frame pointer.
///
/// `*fp` is the previous frame pointer, in its usual place.
pub const FRAME_PREV_FP: usize = 0;
/// `*(fp + 8)` is `canary << 32 | tag`.
pub const FRAME_CANARY_TAG: usize = 8;
/// `*(fp + 16)` is the generation assigned on function entry.
pub const FRAME_GENERATION: usize = 16;
/// `*(fp + 24)` is the return address, in its natural slot.
pub const FRAME_RETURN_ADDR: usize = 24;

/// TLS word offsets, in bytes relative to the thread pointer (negative).
///
/// `fs:-8`: the frame pointer at the most recent checkpoint.
pub const TLS_CURRENT_FP: isize = -8;
/// `fs:-16`: the per-thread generation counter.
pub const TLS_GENERATION: isize = -16;
/// `fs:-24`: `canary << 32 | tag` for stamping new frames.
pub const TLS_CANARY_TAG: isize = -24;
/// `fs:-32`: the thread's registry slot index.
pub const TLS_SLOT_INDEX: isize = -32;

/// Deepest stack the monitor will walk.
pub const MAX_CALLDEPTH: usize = 1024;

/// Widest stack the monitor will accept: frame pointers must lie within
/// `[stack_base - MAX_STACK, stack_base]`.
pub const MAX_STACK: usize = 8 << 20;

/// The canary positioned in the high half of a canary/tag word, tag zero.
#[inline]
pub(crate) fn canary_word() -> u64 {
    (CANARY as u64) << 32
}

/// Splits a canary/tag word into its (canary, tag) halves.
#[inline]
pub(crate) fn split_canary_tag(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

/// Seeds an outermost frame at `fp`: null previous frame pointer, canary
/// set with tag zero, generation 0. The return address slot is left as-is.
///
/// # Safety
///
/// `fp` must be valid for writes of four consecutive `u64` words.
pub(crate) unsafe fn seed_outermost_frame(fp: *mut u64) {
    fp.write(0);
    fp.add(FRAME_CANARY_TAG / 8).write(canary_word());
    fp.add(FRAME_GENERATION / 8).write(0);
}

/// Heuristic check that `fp` is a frame pointer on the calling thread's
/// stack: non-null, 8-aligned, above the current stack pointer, and within
/// [`MAX_STACK`] of it. Used before writing through an
/// instrumentation-provided checkpoint so an uninstrumented process never
/// has arbitrary memory scribbled on.
pub(crate) fn plausible_stack_fp(fp: usize) -> bool {
    let probe = &fp as *const usize as usize;
    fp != 0 && fp & 7 == 0 && fp > probe && fp - probe < MAX_STACK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_frame_words() {
        let mut frame = [0xffff_ffff_ffff_ffff_u64; 4];
        unsafe { seed_outermost_frame(frame.as_mut_ptr()) };
        assert_eq!(frame[0], 0);
        assert_eq!(frame[1], (CANARY as u64) << 32);
        assert_eq!(frame[2], 0);
        // The return address slot is untouched.
        assert_eq!(frame[3], 0xffff_ffff_ffff_ffff);
    }

    #[test]
    fn canary_tag_split() {
        let (canary, tag) = split_canary_tag(canary_word() | 77);
        assert_eq!(canary, CANARY);
        assert_eq!(tag, 77);
    }

    #[test]
    fn plausible_rejects_null_and_misaligned() {
        assert!(!plausible_stack_fp(0));
        assert!(!plausible_stack_fp(0x7fff_0000_0001));
    }

    #[test]
    fn plausible_accepts_a_parent_frame_address() {
        // An address well above one of our own locals looks like a
        // caller's frame.
        let local = 0_u64;
        let addr = (&local as *const u64 as usize + 4096) & !7;
        assert!(plausible_stack_fp(addr));
    }
}
