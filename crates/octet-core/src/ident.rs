//! Record identifier generation and validation
//!
//! Identifiers are 36 lowercase-hex characters in the familiar hyphenated
//! shape `xxxxxxxx-xxxx-4xxx-yxxx-xxxxxxxxxxxx`, assembled from a
//! high-resolution clock reading, a process-wide counter, and 60 random
//! bits:
//!
//! - chars 0..8: bits 0..32 of the clock reading
//! - chars 9..13: bits 32..48 of the clock reading
//! - char 14 is the literal `4`, chars 15..18 are the low 12 counter bits
//! - char 19 is a variant nibble in {8, 9, a, b}, chars 20..23 are 12
//!   random bits
//! - chars 24..36 are 48 random bits
//!
//! Within one process no two generated identifiers collide: the counter is
//! monotonic modulo 4096 and the clock component changes between counter
//! wraps at any plausible throughput. The random tail makes cross-process
//! collisions astronomically unlikely, but they are not formally precluded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

/// Length of the textual form.
pub const ID_LEN: usize = 36;

/// Process-wide generation counter; only the low 12 bits reach the id.
static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a fresh identifier.
pub fn generate() -> String {
    let ticks = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let random: u64 = rand::thread_rng().gen();
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);

    format!(
        "{:08x}-{:04x}-4{:03x}-{:x}{:03x}-{:012x}",
        ticks & 0xffff_ffff,
        (ticks >> 32) & 0xffff,
        count & 0xfff,
        8 + (random & 0x3),
        (random >> 2) & 0xfff,
        (random >> 14) & 0xffff_ffff_ffff,
    )
}

/// Structural validation of the textual form. Hex characters must be
/// lowercase.
pub fn is_valid(id: &str) -> bool {
    let bytes = id.as_bytes();
    if bytes.len() != ID_LEN {
        return false;
    }
    bytes.iter().enumerate().all(|(i, &b)| match i {
        8 | 13 | 18 | 23 => b == b'-',
        14 => b == b'4',
        19 => matches!(b, b'8' | b'9' | b'a' | b'b'),
        _ => matches!(b, b'0'..=b'9' | b'a'..=b'f'),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_generated_ids_are_valid() {
        for _ in 0..1000 {
            let id = generate();
            assert!(is_valid(&id), "invalid id generated: {}", id);
        }
    }

    #[test]
    fn test_structure() {
        let id = generate();
        assert_eq!(id.len(), ID_LEN);
        let bytes = id.as_bytes();
        assert_eq!(bytes[8], b'-');
        assert_eq!(bytes[13], b'-');
        assert_eq!(bytes[18], b'-');
        assert_eq!(bytes[23], b'-');
        assert_eq!(bytes[14], b'4');
        assert!(matches!(bytes[19], b'8' | b'9' | b'a' | b'b'));
    }

    #[test]
    fn test_validation_rejects_malformed() {
        assert!(!is_valid(""));
        assert!(!is_valid("not-an-id"));
        // Too short by one.
        assert!(!is_valid("0000000-0000-4000-8000-000000000000"));
        // Uppercase hex.
        assert!(!is_valid("ABCDEF01-0000-4000-8000-000000000000"));
        // Wrong version nibble.
        assert!(!is_valid("00000000-0000-5000-8000-000000000000"));
        // Wrong variant nibble.
        assert!(!is_valid("00000000-0000-4000-7000-000000000000"));
        // Separator replaced.
        assert!(!is_valid("00000000_0000-4000-8000-000000000000"));
    }

    #[test]
    fn test_validation_accepts_fixture() {
        assert!(is_valid("01234567-89ab-4cde-8f01-23456789abcd"));
        assert!(is_valid("00000000-0000-4000-b000-000000000000"));
    }

    #[test]
    fn test_uniqueness_across_threads() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 15_000;

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                thread::spawn(|| {
                    let mut ids = Vec::with_capacity(PER_THREAD);
                    for _ in 0..PER_THREAD {
                        ids.push(generate());
                    }
                    ids
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(all.insert(id), "duplicate identifier generated");
            }
        }
        assert_eq!(all.len(), THREADS * PER_THREAD);
    }
}
