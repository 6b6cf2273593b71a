//! Transaction id assignment.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::message::UNSOLICITED_ID;

/// Monotonically increasing transaction ids for one endpoint.
///
/// Ids start at 1 and are never reused within a process lifetime except on
/// `u32` overflow, where the counter wraps and skips the unsolicited id.
#[derive(Debug)]
pub struct TransactionRegistry {
    next: AtomicU32,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    /// Assign the next transaction id.
    pub fn next_id(&self) -> u32 {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        if id == UNSOLICITED_ID {
            self.next.fetch_add(1, Ordering::Relaxed)
        } else {
            id
        }
    }

    /// Most recently assigned id, if any.
    pub fn last_issued(&self) -> Option<u32> {
        match self.next.load(Ordering::Relaxed).wrapping_sub(1) {
            UNSOLICITED_ID => None,
            id => Some(id),
        }
    }
}

impl Default for TransactionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_strictly_increase() {
        let registry = TransactionRegistry::new();
        assert_eq!(registry.last_issued(), None);

        let ids: Vec<u32> = (0..1000).map(|_| registry.next_id()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(ids[0], 1);
        assert_eq!(registry.last_issued(), Some(1000));
    }

    #[test]
    fn test_wrap_skips_unsolicited_id() {
        let registry = TransactionRegistry {
            next: AtomicU32::new(u32::MAX),
        };
        assert_eq!(registry.next_id(), u32::MAX);
        assert_eq!(registry.next_id(), 1);
    }
}
