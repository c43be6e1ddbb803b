//! 128-bit identifiers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Opaque 128-bit identifier stored as two 64-bit words.
///
/// Used for caller ids, session ids, command-instance ids and the last event
/// id a caller has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id {
    words: [u64; 2],
}

impl Id {
    /// The all-zero id.
    pub const NIL: Id = Id { words: [0, 0] };

    pub const fn new(first: u64, second: u64) -> Self {
        Self {
            words: [first, second],
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        let value = uuid.as_u128();
        Self::new((value >> 64) as u64, value as u64)
    }

    pub fn words(&self) -> [u64; 2] {
        self.words
    }

    pub fn is_nil(&self) -> bool {
        *self == Self::NIL
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.words[0], self.words[1])
    }
}

/// Source of fresh ids. Implementations must never return the same id twice.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> Id;
}

/// Ids from random (v4) UUIDs.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdGenerator;

impl IdGenerator for RandomIdGenerator {
    fn next_id(&self) -> Id {
        Id::from_uuid(Uuid::new_v4())
    }
}

/// Ids made of a fixed node word and a monotonically increasing counter.
#[derive(Debug)]
pub struct SequentialIdGenerator {
    node: u64,
    next: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new(node: u64) -> Self {
        Self {
            node,
            next: AtomicU64::new(1),
        }
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> Id {
        Id::new(self.node, self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_equality_is_word_pair_equality() {
        assert_eq!(Id::new(1, 2), Id::new(1, 2));
        assert_ne!(Id::new(1, 2), Id::new(2, 1));
        assert!(Id::default().is_nil());
        assert!(!Id::new(0, 1).is_nil());
    }

    #[test]
    fn test_from_uuid_splits_high_and_low_words() {
        let uuid = Uuid::from_u128(0x0011_2233_4455_6677_8899_aabb_ccdd_eeff);
        let id = Id::from_uuid(uuid);
        assert_eq!(id.words(), [0x0011_2233_4455_6677, 0x8899_aabb_ccdd_eeff]);
        assert_eq!(id.to_string(), "00112233445566778899aabbccddeeff");
    }

    #[test]
    fn test_sequential_generator_never_repeats() {
        let generator = Arc::new(SequentialIdGenerator::new(7));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let generator = generator.clone();
                std::thread::spawn(move || {
                    (0..1000).map(|_| generator.next_id()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert_eq!(id.words()[0], 7);
                assert!(seen.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(seen.len(), 4000);
    }

    #[test]
    fn test_random_generator_distinct() {
        let generator = RandomIdGenerator;
        let a = generator.next_id();
        let b = generator.next_id();
        assert_ne!(a, b);
    }
}
