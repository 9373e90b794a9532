//! Time-ordered holding area for work that becomes due later.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// Items keyed by the instant they become due.
///
/// Items due at the same instant come out in the order they were scheduled.
#[derive(Debug)]
pub struct DelayedQueue<T> {
    entries: BTreeMap<(DateTime<Utc>, u64), T>,
    sequence: u64,
}

impl<T> Default for DelayedQueue<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            sequence: 0,
        }
    }
}

impl<T> DelayedQueue<T> {
    /// Creates an empty schedule.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `item`, due at `due_at`. Equal due times keep insertion order.
    pub fn schedule(&mut self, due_at: DateTime<Utc>, item: T) {
        self.entries.insert((due_at, self.sequence), item);
        self.sequence = self.sequence.wrapping_add(1);
    }

    /// Removes and returns every item due at or before `now`, earliest first.
    pub fn drain_due(&mut self, now: DateTime<Utc>) -> Vec<T> {
        let later = self.entries.split_off(&(now, u64::MAX));
        let mut due = std::mem::replace(&mut self.entries, later);
        // split_off keeps the boundary key on the right-hand side
        if let Some(item) = self.entries.remove(&(now, u64::MAX)) {
            due.insert((now, u64::MAX), item);
        }
        due.into_values().collect()
    }

    /// Returns the earliest due time.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.entries.keys().next().map(|(due_at, _)| *due_at)
    }

    /// Keeps only the items `keep` accepts.
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) {
        self.entries.retain(|_, item| keep(item));
    }

    /// Iterates items in due order.
    pub fn iter(&self) -> impl Iterator<Item = (DateTime<Utc>, &T)> {
        self.entries.iter().map(|((due_at, _), item)| (*due_at, item))
    }

    /// Returns the number of scheduled items.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every scheduled item.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn drains_only_due_items_in_order() {
        let mut queue = DelayedQueue::new();
        queue.schedule(at(30), "c");
        queue.schedule(at(10), "a");
        queue.schedule(at(20), "b");

        assert_eq!(queue.next_due(), Some(at(10)));
        assert_eq!(queue.drain_due(at(20)), vec!["a", "b"]);
        assert_eq!(queue.len(), 1);
        assert!(queue.drain_due(at(29)).is_empty());
        assert_eq!(queue.drain_due(at(30) + Duration::seconds(1)), vec!["c"]);
        assert!(queue.is_empty());
        assert_eq!(queue.next_due(), None);
    }

    #[test]
    fn same_instant_keeps_schedule_order() {
        let mut queue = DelayedQueue::new();
        for n in 0..5 {
            queue.schedule(at(0), n);
        }
        assert_eq!(queue.drain_due(at(0)), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn retain_drops_matching_items() {
        let mut queue = DelayedQueue::new();
        queue.schedule(at(1), 1);
        queue.schedule(at(2), 2);
        queue.schedule(at(3), 3);

        queue.retain(|n| n % 2 == 1);

        let remaining: Vec<_> = queue.iter().map(|(_, n)| *n).collect();
        assert_eq!(remaining, vec![1, 3]);
    }
}
