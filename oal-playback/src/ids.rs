//! Process-wide monotonic id allocation.
//!
//! Device, file and sound ids must never collide within a process (spec
//! global invariant), which is naturally satisfied by atomic counters rather
//! than a mutex-guarded module-level variable.

use std::sync::atomic::{AtomicI32, Ordering};

static NEXT_FILE_ID: AtomicI32 = AtomicI32::new(0);
static NEXT_SOUND_ID: AtomicI32 = AtomicI32::new(0);

/// Allocates the next process-wide file id.
///
/// File ids are allocated globally across all devices even though the
/// backing buffer they name is cached per device: a file id names "the same
/// logical sound", the buffer is a per-device resource.
pub fn next_file_id() -> i32 {
    NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Allocates the next process-wide sound id.
pub fn next_sound_id() -> i32 {
    NEXT_SOUND_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_ids_are_monotonic() {
        let a = next_file_id();
        let b = next_file_id();
        assert!(b > a);
    }

    #[test]
    fn sound_ids_are_monotonic() {
        let a = next_sound_id();
        let b = next_sound_id();
        assert!(b > a);
    }
}
