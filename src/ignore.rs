//! Expected-error sequence tracking.
//!
//! Requests that intentionally race a window's destruction (freeing a
//! pixmap that may already be gone, subtracting damage on a dying
//! window) produce protocol errors we must not treat as failures. The
//! request's sequence number is registered here; when the error reply
//! arrives it is matched and dropped. The queue is pruned against the
//! newest sequence number seen, so it stays bounded.

use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct IgnoreQueue {
    /// Sequence numbers in issue order (monotonically increasing).
    seqs: VecDeque<u64>,
}

impl IgnoreQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request whose error reply must be swallowed. Only
    /// the low 16 bits are kept; error replies carry the truncated
    /// wire sequence number.
    pub fn expect(&mut self, sequence: u64) {
        self.seqs.push_back(sequence & 0xffff);
    }

    /// Drop entries for requests the server has already answered.
    /// `latest` is the newest sequence number seen in any reply or
    /// event; everything at or below it can no longer error.
    pub fn prune(&mut self, latest: u64) {
        while let Some(&front) = self.seqs.front() {
            if front < latest {
                self.seqs.pop_front();
            } else {
                break;
            }
        }
    }

    /// True when an error with this sequence number was expected.
    /// Matching consumes the entry and everything older.
    pub fn should_ignore(&mut self, sequence: u64) -> bool {
        self.prune(sequence);
        if self.seqs.front() == Some(&sequence) {
            self.seqs.pop_front();
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.seqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seqs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_error_is_ignored_once() {
        let mut q = IgnoreQueue::new();
        q.expect(100);
        assert!(q.should_ignore(100));
        assert!(!q.should_ignore(100));
    }

    #[test]
    fn test_unexpected_error_is_surfaced() {
        let mut q = IgnoreQueue::new();
        q.expect(100);
        assert!(!q.should_ignore(99));
        assert!(!q.should_ignore(101));
    }

    #[test]
    fn test_prune_bounds_memory() {
        let mut q = IgnoreQueue::new();
        for seq in 0..1000 {
            q.expect(seq);
        }
        q.prune(990);
        assert_eq!(q.len(), 10);
        q.prune(10_000);
        assert!(q.is_empty());
    }

    #[test]
    fn test_match_consumes_older_entries() {
        let mut q = IgnoreQueue::new();
        q.expect(10);
        q.expect(20);
        q.expect(30);
        // The error for 20 implies 10 completed without erroring.
        assert!(q.should_ignore(20));
        assert_eq!(q.len(), 1);
        assert!(q.should_ignore(30));
    }
}
