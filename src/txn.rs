//! Transaction id generation.
//!
//! Every request that leaves the client without a transaction id is stamped
//! with one from a [`TxnIdGenerator`]. Responses are routed back to callers
//! purely by this id, so two in-flight requests on the same connection must
//! never share one.
//!
//! The generator is an explicit handle rather than module-level state:
//! create it once and hand clones to every [`ClientBuilder`](crate::ClientBuilder)
//! that should draw from the same sequence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Prefix for generated transaction ids.
pub const TXN_ID_PREFIX: &str = "rs";

/// Monotonic transaction id source.
///
/// Cheap to clone; clones share the same counter.
#[derive(Debug, Clone, Default)]
pub struct TxnIdGenerator {
    counter: Arc<AtomicU64>,
}

impl TxnIdGenerator {
    /// Create a generator whose first id is `rs1`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the next id.
    #[inline]
    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}{}", TXN_ID_PREFIX, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_are_sequential() {
        let ids = TxnIdGenerator::new();
        assert_eq!(ids.next_id(), "rs1");
        assert_eq!(ids.next_id(), "rs2");
    }

    #[test]
    fn test_clones_share_counter() {
        let a = TxnIdGenerator::new();
        let b = a.clone();
        a.next_id();
        assert_eq!(b.next_id(), "rs2");
    }

    #[test]
    fn test_unique_under_concurrency() {
        let ids = TxnIdGenerator::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ids = ids.clone();
                std::thread::spawn(move || (0..1000).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate transaction id");
            }
        }
        assert_eq!(seen.len(), 8000);
    }
}
