//! The request tag API.
//!
//! Tags are user-supplied 64-bit logical request identifiers. Each call
//! posts one timestamped event into the calling thread's ring; consumers of
//! the log join tag events to stack events by thread id and time range.
//! `set`, `unset`, and `clear` also maintain the tag half of the TLS
//! canary/tag word so the instrumentation stamps the current tag into
//! subsequent frames. Calls from unregistered threads are silent no-ops;
//! nothing here can fail into the application.

use crate::arch;
use crate::event::{self, EventKind};
use crate::shim;

/// Writes `tag` into the low half of the TLS canary/tag word, preserving
/// the canary half.
fn set_tls_tag(tag: u32) {
    if shim::tls_words_owned() {
        let word = (arch::tls_canary_tag() & 0xffff_ffff_0000_0000) | tag as u64;
        // SAFETY: `tls_words_owned` means this thread's handshake region is
        // reserved for us.
        unsafe { arch::tls_set_canary_tag(word) };
    }
}

/// Starts attributing the calling thread's work to `tag`.
pub fn set(tag: u64) {
    set_tls_tag(tag as u32);
    event::post(EventKind::TagSet, tag, 0, 0);
}

/// Stops attributing the calling thread's work to `tag`.
pub fn unset(tag: u64) {
    set_tls_tag(0);
    event::post(EventKind::TagUnset, tag, 0, 0);
}

/// Drops any tag attribution on the calling thread.
pub fn clear() {
    set_tls_tag(0);
    event::post(EventKind::TagClear, 0, 0, 0);
}

/// Records that the calling thread blocked on behalf of `tag`.
pub fn block(tag: u64) {
    event::post(EventKind::TagBlock, tag, 0, 0);
}

/// C ABI for instrumented applications.
#[cfg(feature = "interpose")]
mod cabi {
    #[no_mangle]
    extern "C" fn ldb_tag_set(tag: u64) {
        super::set(tag);
    }

    #[no_mangle]
    extern "C" fn ldb_tag_unset(tag: u64) {
        super::unset(tag);
    }

    #[no_mangle]
    extern "C" fn ldb_tag_clear() {
        super::clear();
    }

    #[no_mangle]
    extern "C" fn ldb_tag_block(tag: u64) {
        super::block(tag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventRecord;
    use crate::registry;
    use crate::shim::{register_current_thread, unregister_current_thread, FrameSeed, Seed};

    #[test]
    fn unregistered_thread_is_a_silent_noop() {
        assert!(registry::current_slot().is_none());
        set(1);
        unset(1);
        clear();
        block(2);
        assert!(registry::current_slot().is_none());
    }

    #[test]
    fn registered_thread_posts_tag_events_in_order() {
        let mut seed = FrameSeed::new();
        let idx = register_current_thread(Seed::Detached {
            frame: seed.as_mut_ptr(),
        })
        .unwrap();

        set(42);
        block(42);
        unset(42);
        clear();

        let mut events: Vec<EventRecord> = Vec::new();
        registry::with_current(|_, ring| {
            // SAFETY: No logger runs in tests; this thread is the ring's
            // sole consumer.
            unsafe { ring.consume(|run| events.extend_from_slice(run)) };
        });
        let kinds: Vec<u32> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::ThreadCreate as u32,
                EventKind::TagSet as u32,
                EventKind::TagBlock as u32,
                EventKind::TagUnset as u32,
                EventKind::TagClear as u32,
            ]
        );
        assert_eq!(events[1].arg1, 42);
        assert_eq!(events[4].arg1, 0);
        // Timestamps are non-decreasing within the ring.
        let stamps: Vec<(u32, u32)> = events.iter().map(|e| (e.sec, e.nsec)).collect();
        let mut sorted = stamps.clone();
        sorted.sort();
        assert_eq!(stamps, sorted);

        unregister_current_thread(idx);
        drop(registry::registry().take_retired());
    }
}
