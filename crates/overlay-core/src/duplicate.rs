//! Bounded memory of recently seen message ids.

use std::collections::{HashSet, VecDeque};

pub const DEFAULT_DUPLICATE_CAPACITY: usize = 10_000;

/// Remembers the last `capacity` ids, forgetting the oldest first.
#[derive(Debug)]
pub struct DuplicateDetector {
    capacity: usize,
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl DuplicateDetector {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Record `id`. Returns true if it was already seen.
    pub fn check_and_add(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return true;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        false
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}

impl Default for DuplicateDetector {
    fn default() -> Self {
        Self::new(DEFAULT_DUPLICATE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_sighting_is_duplicate() {
        let mut detector = DuplicateDetector::default();
        assert!(!detector.check_and_add("m1"));
        assert!(detector.check_and_add("m1"));
        assert!(!detector.check_and_add("m2"));
        assert_eq!(detector.len(), 2);
    }

    #[test]
    fn test_oldest_forgotten_at_capacity() {
        let mut detector = DuplicateDetector::new(2);
        detector.check_and_add("a");
        detector.check_and_add("b");
        detector.check_and_add("c");
        assert_eq!(detector.len(), 2);
        assert!(!detector.check_and_add("a"));
        assert!(detector.check_and_add("c"));
    }
}
