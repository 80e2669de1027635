//! Transaction ID generation.

use std::sync::atomic::{AtomicU64, Ordering};

/// A unique identifier for a transaction. Ids are never reused within a
/// data file: the next id is persisted at every checkpoint and recovery
/// moves past any id found in the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Txn{}", self.0)
    }
}

/// A thread-safe transaction ID generator.
pub struct TransactionIdGenerator {
    next_id: AtomicU64,
}

impl TransactionIdGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(next_id: u64) -> Self {
        Self {
            next_id: AtomicU64::new(next_id.max(1)),
        }
    }

    pub fn next(&self) -> TransactionId {
        TransactionId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// The id the next call to `next` will hand out.
    pub fn peek(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }
}

impl Default for TransactionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_id_display() {
        let id = TransactionId::new(123);
        assert_eq!(format!("{}", id), "Txn123");
    }

    #[test]
    fn test_transaction_id_generator() {
        let generator = TransactionIdGenerator::new();

        assert_eq!(generator.next().value(), 1);
        assert_eq!(generator.next().value(), 2);
        assert_eq!(generator.peek(), 3);
    }

    #[test]
    fn test_generator_resumes_from_persisted_id() {
        let generator = TransactionIdGenerator::starting_at(40);
        assert_eq!(generator.next().value(), 40);
        assert_eq!(generator.peek(), 41);

        // Id 0 is never handed out
        let generator = TransactionIdGenerator::starting_at(0);
        assert_eq!(generator.next().value(), 1);
    }

    #[test]
    fn test_transaction_id_generator_thread_safety() {
        use std::sync::Arc;
        use std::thread;

        let generator = Arc::new(TransactionIdGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gen = Arc::clone(&generator);
                thread::spawn(move || (0..100).map(|_| gen.next().value()).collect::<Vec<_>>())
            })
            .collect();

        let mut all_ids = vec![];
        for handle in handles {
            all_ids.extend(handle.join().unwrap());
        }
        all_ids.sort();
        all_ids.dedup();
        assert_eq!(all_ids.len(), 800);
    }
}
