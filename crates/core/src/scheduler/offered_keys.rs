//! Keys peers have offered to send us.
//!
//! The queue is shared by all priority classes of a scheduler. Offers are
//! never entered into the per-class tables, so servicing them does not
//! reveal which classes hold what.

use blockswarm_api::{NodeKey, Timestamp};
use std::collections::{HashSet, VecDeque};
use std::time::Duration;

#[derive(Debug)]
pub(crate) struct OfferedKeys {
    ttl: Duration,
    max_keys: usize,
    queue: VecDeque<(NodeKey, Timestamp)>,
    keys: HashSet<NodeKey>,
}

impl OfferedKeys {
    pub fn new(ttl: Duration, max_keys: usize) -> Self {
        Self {
            ttl,
            max_keys,
            queue: VecDeque::new(),
            keys: HashSet::new(),
        }
    }

    /// Queue an offer. A repeated offer refreshes the expiry. When full the
    /// oldest offer is dropped. Returns true if the key was not queued yet.
    pub fn queue(&mut self, key: NodeKey, now: Timestamp) -> bool {
        let expires = now + self.ttl;
        if self.keys.contains(&key) {
            self.queue.retain(|(k, _)| k != &key);
            self.queue.push_back((key, expires));
            return false;
        }
        if self.max_keys == 0 {
            return false;
        }
        while self.queue.len() >= self.max_keys {
            if let Some((old, _)) = self.queue.pop_front() {
                tracing::trace!("offered key queue full, dropping {old}");
                self.keys.remove(&old);
            }
        }
        self.keys.insert(key.clone());
        self.queue.push_back((key, expires));
        true
    }

    /// Remove an offer. Returns true if it was queued.
    pub fn dequeue(&mut self, key: &NodeKey) -> bool {
        if !self.keys.remove(key) {
            return false;
        }
        self.queue.retain(|(k, _)| k != key);
        true
    }

    /// Drop offers that expired at or before `now`.
    pub fn expire(&mut self, now: Timestamp) -> usize {
        let before = self.queue.len();
        let keys = &mut self.keys;
        self.queue.retain(|(k, expires)| {
            if *expires <= now {
                keys.remove(k);
                false
            } else {
                true
            }
        });
        before - self.queue.len()
    }

    #[cfg(test)]
    pub fn contains(&self, key: &NodeKey) -> bool {
        self.keys.contains(key)
    }

    /// Offers in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &NodeKey> {
        self.queue.iter().map(|(k, _)| k)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use blockswarm_test_utils::id::create_chk_list;

    #[test]
    fn dedup_and_capacity() {
        let keys = create_chk_list(3);
        let now = Timestamp::from_micros(0);
        let mut offers = OfferedKeys::new(Duration::from_secs(1), 2);

        assert!(offers.queue(keys[0].clone(), now));
        assert!(!offers.queue(keys[0].clone(), now));
        assert_eq!(1, offers.len());

        assert!(offers.queue(keys[1].clone(), now));
        assert!(offers.queue(keys[2].clone(), now));
        assert_eq!(2, offers.len());
        assert!(!offers.contains(&keys[0]));
        assert_eq!(
            vec![&keys[1], &keys[2]],
            offers.iter().collect::<Vec<_>>()
        );

        assert!(offers.dequeue(&keys[1]));
        assert!(!offers.dequeue(&keys[1]));
        assert_eq!(1, offers.len());
    }

    #[test]
    fn expiry() {
        let keys = create_chk_list(2);
        let mut offers = OfferedKeys::new(Duration::from_millis(10), 8);
        offers.queue(keys[0].clone(), Timestamp::from_micros(0));
        offers.queue(keys[1].clone(), Timestamp::from_micros(5_000));

        assert_eq!(1, offers.expire(Timestamp::from_micros(10_000)));
        assert!(!offers.contains(&keys[0]));
        assert!(offers.contains(&keys[1]));
        assert_eq!(1, offers.expire(Timestamp::from_micros(20_000)));
        assert_eq!(0, offers.len());
    }
}
