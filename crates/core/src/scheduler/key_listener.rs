//! Index of which registered gets want which key.

use blockswarm_api::*;
use std::collections::HashMap;

/// One item of one get waiting for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Listener {
    pub request: RequestId,
    pub item: ItemToken,
}

#[derive(Debug)]
struct Entry {
    get: DynSendableGet,
    keys: Vec<NodeKey>,
}

/// Matches arriving blocks to waiting gets without scanning the selector's
/// tables. One tracker per persistence.
#[derive(Debug)]
pub(crate) struct KeyListenerTracker {
    persistence: Persistence,
    by_key: HashMap<NodeKey, Vec<Listener>>,
    requests: HashMap<RequestId, Entry>,
}

impl KeyListenerTracker {
    pub fn new(persistence: Persistence) -> Self {
        Self {
            persistence,
            by_key: HashMap::new(),
            requests: HashMap::new(),
        }
    }

    /// Index every item the get currently lists. Returns false if the get
    /// was already tracked, or belongs in the other tracker.
    pub fn add_request(&mut self, get: &DynSendableGet) -> bool {
        let id = get.common().id();
        if get.common().persistence() != self.persistence {
            tracing::warn!("{id} does not belong in the {:?} tracker", self.persistence);
            return false;
        }
        if self.requests.contains_key(&id) {
            return false;
        }
        let mut keys = Vec::new();
        for item in get.list_items() {
            self.by_key.entry(item.key.clone()).or_default().push(Listener {
                request: id,
                item: item.token,
            });
            keys.push(item.key);
        }
        self.requests.insert(
            id,
            Entry {
                get: get.clone(),
                keys,
            },
        );
        true
    }

    /// Forget a get. Returns false if it was not tracked.
    pub fn remove_request(&mut self, id: RequestId) -> bool {
        let Some(entry) = self.requests.remove(&id) else {
            return false;
        };
        for key in entry.keys {
            self.remove_listener(&key, |l| l.request == id);
        }
        true
    }

    /// Stop listening for `key` on behalf of one get. Returns false if the
    /// get was not listening for it.
    pub fn remove_key(&mut self, id: RequestId, key: &NodeKey) -> bool {
        let removed = self.remove_listener(key, |l| l.request == id);
        if let Some(entry) = self.requests.get_mut(&id) {
            entry.keys.retain(|k| k != key);
        }
        removed
    }

    /// Stop listening on behalf of one item, once it has an outcome.
    /// Returns false if the item was not listening.
    pub fn remove_item(&mut self, id: RequestId, item: ItemToken) -> bool {
        let Some(entry) = self.requests.get(&id) else {
            return false;
        };
        let target = Listener { request: id, item };
        let Some(key) = entry
            .keys
            .iter()
            .find(|k| self.by_key.get(*k).is_some_and(|l| l.contains(&target)))
            .cloned()
        else {
            return false;
        };
        self.remove_listener(&key, |l| *l == target);
        let still_listening = self
            .by_key
            .get(&key)
            .is_some_and(|l| l.iter().any(|l| l.request == id));
        if !still_listening {
            if let Some(entry) = self.requests.get_mut(&id) {
                entry.keys.retain(|k| k != &key);
            }
        }
        true
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.requests.contains_key(&id)
    }

    pub fn want_key(&self, key: &NodeKey) -> bool {
        self.by_key.contains_key(key)
    }

    /// The most urgent priority among live gets listening for `key`.
    pub fn priority_for(&self, key: &NodeKey) -> Option<PriorityClass> {
        self.by_key
            .get(key)?
            .iter()
            .filter_map(|l| self.requests.get(&l.request))
            .filter(|e| !e.get.common().is_cancelled())
            .map(|e| e.get.common().priority())
            .min()
    }

    /// Remove and return the listeners for `key`, with their gets.
    pub fn take_matches(
        &mut self,
        key: &NodeKey,
    ) -> Vec<(DynSendableGet, ItemToken)> {
        let Some(listeners) = self.by_key.remove(key) else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(listeners.len());
        for l in listeners {
            if let Some(entry) = self.requests.get_mut(&l.request) {
                entry.keys.retain(|k| k != key);
                out.push((entry.get.clone(), l.item));
            }
        }
        out
    }

    /// Number of tracked gets.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    fn remove_listener(
        &mut self,
        key: &NodeKey,
        f: impl Fn(&Listener) -> bool,
    ) -> bool {
        let Some(list) = self.by_key.get_mut(key) else {
            return false;
        };
        let before = list.len();
        list.retain(|l| !f(l));
        let removed = list.len() != before;
        if list.is_empty() {
            self.by_key.remove(key);
        }
        removed
    }
}
