//! The pick-next algorithm and the two deduplication sets.

use super::config::{CoreSchedulerConfig, PriorityPolicy};
use super::cooldown::CooldownList;
use super::offered_keys::OfferedKeys;
use blockswarm_api::*;
use rand::Rng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

/// Who a key in the fetching set is being fetched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FetchingEntry {
    /// `None` while servicing an offered key.
    pub request: Option<RequestId>,
    pub persistence: Persistence,
}

/// What [RequestSelector::choose_request] picked.
#[derive(Debug)]
pub(crate) enum Selection {
    Item {
        request: SendableRequest,
        item: RequestItem,
    },
    Offer {
        key: NodeKey,
    },
}

/// A request dropped from the tables while choosing.
#[derive(Debug)]
pub(crate) struct Removed {
    pub request: SendableRequest,
    pub cancelled: bool,
    /// Items still listed and not in flight. A cancelled request is owed a
    /// cancellation outcome for each of them.
    pub idle_items: Vec<ItemToken>,
}

#[derive(Debug, Default)]
pub(crate) struct ChooseOutcome {
    pub selection: Option<Selection>,
    pub removed: Vec<Removed>,
}

#[derive(Debug)]
struct Registered {
    request: SendableRequest,
    class: PriorityClass,
}

#[derive(Debug)]
pub(crate) struct RequestSelector {
    is_insert: bool,
    policy: PriorityPolicy,
    skip_percent: u8,
    max_recent_successes: usize,
    tables: [Vec<RequestId>; PriorityClass::COUNT],
    requests: HashMap<RequestId, Registered>,
    fetching: HashMap<NodeKey, FetchingEntry>,
    running_inserts: HashSet<(RequestId, ItemToken)>,
    recent_successes: VecDeque<RequestId>,
    pub cooldown: CooldownList,
    pub offered: OfferedKeys,
}

impl RequestSelector {
    pub fn new(is_insert: bool, config: &CoreSchedulerConfig) -> Self {
        Self {
            is_insert,
            policy: config.priority_policy,
            skip_percent: config.soft_priority_skip_percent.min(100),
            max_recent_successes: config.max_recent_successes,
            tables: Default::default(),
            requests: HashMap::new(),
            fetching: HashMap::new(),
            running_inserts: HashSet::new(),
            recent_successes: VecDeque::new(),
            cooldown: CooldownList::new(
                config.first_cooldown_ms,
                config.last_cooldown_ms,
                config.num_cooldown_intervals,
            ),
            offered: OfferedKeys::new(
                Duration::from_millis(config.offered_key_ttl_ms as u64),
                config.max_offered_keys,
            ),
        }
    }

    /// File a request under its current priority. Returns false if it is
    /// already registered.
    pub fn add_request(&mut self, request: SendableRequest) -> bool {
        let id = request.id();
        if self.requests.contains_key(&id) {
            return false;
        }
        let class = request.priority();
        self.tables[class.index()].push(id);
        self.requests.insert(id, Registered { request, class });
        true
    }

    pub fn remove_request(&mut self, id: RequestId) -> Option<SendableRequest> {
        let reg = self.requests.remove(&id)?;
        self.tables[reg.class.index()].retain(|r| *r != id);
        self.cooldown.remove_request(id);
        self.recent_successes.retain(|r| *r != id);
        Some(reg.request)
    }

    /// Move a request whose priority changed from `old` to its current
    /// class. Returns false if the request is not registered.
    pub fn reregister(&mut self, id: RequestId, old: PriorityClass) -> bool {
        let Some(reg) = self.requests.get_mut(&id) else {
            return false;
        };
        if reg.class != old {
            tracing::warn!(
                "{id} filed under {:?}, not the stated old priority {old:?}",
                reg.class
            );
        }
        let new = reg.request.priority();
        if new == reg.class {
            return true;
        }
        let from = reg.class;
        reg.class = new;
        self.tables[from.index()].retain(|r| *r != id);
        self.tables[new.index()].push(id);
        true
    }

    pub fn get(&self, id: RequestId) -> Option<&SendableRequest> {
        self.requests.get(&id).map(|r| &r.request)
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.requests.contains_key(&id)
    }

    pub fn remove_fetching_key(&mut self, key: &NodeKey) -> bool {
        self.fetching.remove(key).is_some()
    }

    pub fn fetching_entry(&self, key: &NodeKey) -> Option<FetchingEntry> {
        self.fetching.get(key).copied()
    }

    pub fn add_running_insert(&mut self, id: RequestId, item: ItemToken) -> bool {
        self.running_inserts.insert((id, item))
    }

    pub fn remove_running_insert(&mut self, id: RequestId, item: ItemToken) -> bool {
        self.running_inserts.remove(&(id, item))
    }

    pub fn fetching_count(&self) -> usize {
        self.fetching.len()
    }

    pub fn running_insert_count(&self) -> usize {
        self.running_inserts.len()
    }

    /// Registered requests per priority class.
    pub fn class_counts(&self) -> [usize; PriorityClass::COUNT] {
        let mut out = [0; PriorityClass::COUNT];
        for (i, table) in self.tables.iter().enumerate() {
            out[i] = table.len();
        }
        out
    }

    /// Remember a request that just completed an item, so it is tried
    /// first within its class.
    pub fn note_success(&mut self, id: RequestId) {
        if self.max_recent_successes == 0 {
            return;
        }
        self.recent_successes.retain(|r| *r != id);
        self.recent_successes.push_front(id);
        self.recent_successes.truncate(self.max_recent_successes);
    }

    /// Pick the next item to send and mark it in flight.
    ///
    /// `offer_priority` reports the most urgent class of any get listening
    /// for an offered key.
    pub fn choose_request<R: Rng>(
        &mut self,
        now: Timestamp,
        accept_offers: bool,
        offer_priority: impl Fn(&NodeKey) -> Option<PriorityClass>,
        rng: &mut R,
    ) -> ChooseOutcome {
        self.offered.expire(now);

        let mut out = ChooseOutcome::default();
        let mut deferred = Vec::new();
        for class in PriorityClass::ALL {
            if self.policy == PriorityPolicy::Soft
                && !self.tables[class.index()].is_empty()
                && rng.gen_range(0..100u8) < self.skip_percent
            {
                deferred.push(class);
                continue;
            }
            out.selection = self.choose_in_class(
                class,
                now,
                accept_offers,
                &offer_priority,
                rng,
                &mut out.removed,
            );
            if out.selection.is_some() {
                return out;
            }
        }

        for class in deferred {
            out.selection = self.choose_in_class(
                class,
                now,
                accept_offers,
                &offer_priority,
                rng,
                &mut out.removed,
            );
            if out.selection.is_some() {
                break;
            }
        }
        out
    }

    fn choose_in_class<R: Rng>(
        &mut self,
        class: PriorityClass,
        now: Timestamp,
        accept_offers: bool,
        offer_priority: &impl Fn(&NodeKey) -> Option<PriorityClass>,
        rng: &mut R,
        removed: &mut Vec<Removed>,
    ) -> Option<Selection> {
        if accept_offers && !self.is_insert {
            let offer = self
                .offered
                .iter()
                .find(|k| {
                    !self.fetching.contains_key(*k)
                        && offer_priority(*k).is_some_and(|p| p <= class)
                })
                .cloned();
            if let Some(key) = offer {
                self.offered.dequeue(&key);
                self.fetching.insert(
                    key.clone(),
                    FetchingEntry {
                        request: None,
                        persistence: Persistence::Ephemeral,
                    },
                );
                return Some(Selection::Offer { key });
            }
        }

        let table = &self.tables[class.index()];
        if table.is_empty() {
            return None;
        }

        // recent successes first, then the whole class from a random start
        let recent: Vec<RequestId> = self
            .recent_successes
            .iter()
            .filter(|id| self.requests.get(*id).is_some_and(|r| r.class == class))
            .copied()
            .collect();
        let start = rng.gen_range(0..table.len());
        let mut order = Vec::with_capacity(table.len());
        order.extend_from_slice(&recent);
        order.extend(
            table[start..]
                .iter()
                .chain(table[..start].iter())
                .filter(|id| !recent.contains(id))
                .copied(),
        );

        for id in order {
            if let Some(selection) = self.try_request(id, now, removed) {
                return Some(selection);
            }
        }
        None
    }

    fn try_request(
        &mut self,
        id: RequestId,
        now: Timestamp,
        removed: &mut Vec<Removed>,
    ) -> Option<Selection> {
        let request = self.requests.get(&id)?.request.clone();
        let items = request.list_items();

        if request.is_cancelled() {
            let idle_items = items
                .iter()
                .filter(|i| !self.is_in_flight(&request, i))
                .map(|i| i.token)
                .collect();
            tracing::debug!("dropping cancelled request {id}");
            self.remove_request(id);
            removed.push(Removed {
                request,
                cancelled: true,
                idle_items,
            });
            return None;
        }

        if items.is_empty() {
            tracing::trace!("dropping exhausted request {id}");
            self.remove_request(id);
            removed.push(Removed {
                request,
                cancelled: false,
                idle_items: Vec::new(),
            });
            return None;
        }

        for item in items {
            if self.cooldown.is_cooling_down(id, item.token, now) {
                continue;
            }
            if request.is_insert() {
                if self.running_inserts.insert((id, item.token)) {
                    return Some(Selection::Item { request, item });
                }
            } else if !self.fetching.contains_key(&item.key) {
                self.fetching.insert(
                    item.key.clone(),
                    FetchingEntry {
                        request: Some(id),
                        persistence: request.persistence(),
                    },
                );
                return Some(Selection::Item { request, item });
            }
        }
        None
    }

    fn is_in_flight(&self, request: &SendableRequest, item: &RequestItem) -> bool {
        if request.is_insert() {
            self.running_inserts.contains(&(request.id(), item.token))
        } else {
            self.fetching
                .get(&item.key)
                .is_some_and(|e| e.request == Some(request.id()))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use blockswarm_test_utils::{id::create_chk_list, request::*};
    use rand::{rngs::StdRng, SeedableRng};

    fn hard() -> CoreSchedulerConfig {
        CoreSchedulerConfig {
            priority_policy: PriorityPolicy::Hard,
            ..Default::default()
        }
    }

    fn get(priority: PriorityClass, keys: Vec<NodeKey>) -> SendableRequest {
        let (_, get) =
            TestGet::new(test_common(Persistence::Durable, priority), keys)
                .build();
        get.into()
    }

    fn t0() -> Timestamp {
        Timestamp::from_micros(0)
    }

    fn pick(s: &mut RequestSelector, rng: &mut StdRng) -> Option<Selection> {
        s.choose_request(t0(), true, |_| None, rng).selection
    }

    fn picked_item(sel: Option<Selection>) -> (RequestId, RequestItem) {
        match sel {
            Some(Selection::Item { request, item }) => (request.id(), item),
            other => panic!("expected an item, got {other:?}"),
        }
    }

    #[test]
    fn hard_priority_drains_urgent_classes_first() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut s = RequestSelector::new(false, &hard());
        let classes = [
            PriorityClass::ImmediateSplitfile,
            PriorityClass::Maximum,
            PriorityClass::Interactive,
        ];
        let mut by_id = HashMap::new();
        for class in classes {
            let r = get(class, create_chk_list(2));
            by_id.insert(r.id(), class);
            s.add_request(r);
        }

        let mut seen = Vec::new();
        while let Some(sel) = pick(&mut s, &mut rng) {
            let (id, _) = picked_item(Some(sel));
            seen.push(by_id[&id]);
        }
        assert_eq!(6, seen.len());
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(sorted, seen);
    }

    #[test]
    fn at_most_one_fetch_per_key() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut s = RequestSelector::new(false, &hard());
        let keys = create_chk_list(1);
        s.add_request(get(PriorityClass::Update, keys.clone()));
        s.add_request(get(PriorityClass::Update, keys.clone()));

        let (_, item) = picked_item(pick(&mut s, &mut rng));
        assert_eq!(keys[0], item.key);
        assert!(pick(&mut s, &mut rng).is_none());
        assert_eq!(1, s.fetching_count());

        assert!(s.remove_fetching_key(&keys[0]));
        assert!(pick(&mut s, &mut rng).is_some());
    }

    #[test]
    fn running_inserts_are_deduplicated() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut s = RequestSelector::new(true, &hard());
        let (_, insert) = TestInsert::new(
            test_common(Persistence::Ephemeral, PriorityClass::Update),
            create_chk_list(1),
        )
        .build();
        let id = insert.common().id();
        s.add_request(insert.into());

        let (_, item) = picked_item(pick(&mut s, &mut rng));
        assert!(pick(&mut s, &mut rng).is_none());
        assert!(s.remove_running_insert(id, item.token));
        assert!(pick(&mut s, &mut rng).is_some());
    }

    #[test]
    fn cancelled_and_exhausted_requests_are_removed() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut s = RequestSelector::new(false, &hard());
        let cancelled = get(PriorityClass::Maximum, create_chk_list(2));
        let empty = get(PriorityClass::Interactive, Vec::new());
        s.add_request(cancelled.clone());
        s.add_request(empty.clone());

        // One item of the cancelled request goes in flight first.
        picked_item(pick(&mut s, &mut rng));
        cancelled.common().cancel();

        let out = s.choose_request(t0(), true, |_| None, &mut rng);
        assert!(out.selection.is_none());
        assert_eq!(2, out.removed.len());
        let c = out
            .removed
            .iter()
            .find(|r| r.request.id() == cancelled.id())
            .unwrap();
        assert!(c.cancelled);
        assert_eq!(vec![ItemToken(1)], c.idle_items);
        let e = out
            .removed
            .iter()
            .find(|r| r.request.id() == empty.id())
            .unwrap();
        assert!(!e.cancelled);
        assert!(!s.contains(cancelled.id()));
        assert!(!s.contains(empty.id()));
    }

    #[test]
    fn cooling_items_are_skipped() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut s = RequestSelector::new(false, &hard());
        let keys = create_chk_list(2);
        let r = get(PriorityClass::Update, keys.clone());
        let id = r.id();
        s.add_request(r);

        s.cooldown.cool_down(id, ItemToken(0), t0(), true);
        let (_, item) = picked_item(pick(&mut s, &mut rng));
        assert_eq!(ItemToken(1), item.token);
        assert!(pick(&mut s, &mut rng).is_none());

        let later = Timestamp::from_micros(60_000_000);
        let out = s.choose_request(later, false, |_| None, &mut rng);
        let (_, item) = picked_item(out.selection);
        assert_eq!(ItemToken(0), item.token);
    }

    #[test]
    fn ties_are_spread_across_requests() {
        let mut rng = StdRng::seed_from_u64(6);
        let mut s = RequestSelector::new(false, &hard());
        let mut ids = HashSet::new();
        for _ in 0..3 {
            let r = get(PriorityClass::BulkSplitfile, create_chk_list(1));
            ids.insert(r.id());
            s.add_request(r);
        }

        let mut seen = HashSet::new();
        for _ in 0..100 {
            let (id, item) = picked_item(pick(&mut s, &mut rng));
            seen.insert(id);
            s.remove_fetching_key(&item.key);
        }
        assert_eq!(ids, seen);
    }

    #[test]
    fn recent_success_is_tried_first() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut s = RequestSelector::new(false, &hard());
        let a = get(PriorityClass::Update, create_chk_list(1));
        let b = get(PriorityClass::Update, create_chk_list(1));
        s.add_request(a);
        s.add_request(b.clone());
        s.note_success(b.id());

        for _ in 0..20 {
            let (id, item) = picked_item(pick(&mut s, &mut rng));
            assert_eq!(b.id(), id);
            s.remove_fetching_key(&item.key);
        }
    }

    #[test]
    fn soft_priority_lets_lower_classes_through() {
        let config = CoreSchedulerConfig {
            priority_policy: PriorityPolicy::Soft,
            soft_priority_skip_percent: 50,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(8);
        let mut s = RequestSelector::new(false, &config);
        let urgent = get(PriorityClass::Maximum, create_chk_list(1));
        let lazy = get(PriorityClass::Minimum, create_chk_list(1));
        s.add_request(urgent.clone());
        s.add_request(lazy.clone());

        let mut seen = HashSet::new();
        for _ in 0..200 {
            let (id, item) = picked_item(pick(&mut s, &mut rng));
            seen.insert(id);
            s.remove_fetching_key(&item.key);
        }
        assert!(seen.contains(&urgent.id()));
        assert!(seen.contains(&lazy.id()));
    }

    #[test]
    fn offered_keys_bypass_the_tables() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut s = RequestSelector::new(false, &hard());
        let keys = create_chk_list(2);
        s.offered.queue(keys[0].clone(), t0());
        s.offered.queue(keys[1].clone(), t0());

        // nobody listens for keys[1]
        let listening = keys[0].clone();
        let prio = move |k: &NodeKey| {
            (k == &listening).then_some(PriorityClass::Prefetch)
        };

        match s.choose_request(t0(), true, &prio, &mut rng).selection {
            Some(Selection::Offer { key }) => assert_eq!(keys[0], key),
            other => panic!("expected an offer, got {other:?}"),
        }
        assert!(!s.offered.contains(&keys[0]));
        assert_eq!(None, s.fetching_entry(&keys[0]).and_then(|e| e.request));
        assert_eq!(PriorityClass::COUNT, s.class_counts().len());
        assert_eq!(0, s.class_counts().iter().sum::<usize>());

        assert!(s.choose_request(t0(), true, &prio, &mut rng).selection.is_none());
        assert!(s.choose_request(t0(), false, &prio, &mut rng).selection.is_none());
        assert!(s.offered.contains(&keys[1]));
    }

    #[test]
    fn reregister_moves_between_classes() {
        let mut rng = StdRng::seed_from_u64(10);
        let mut s = RequestSelector::new(false, &hard());
        let a = get(PriorityClass::Minimum, create_chk_list(1));
        let b = get(PriorityClass::Update, create_chk_list(1));
        s.add_request(a.clone());
        s.add_request(b);

        let old = a.common().set_priority(PriorityClass::Maximum);
        assert!(s.reregister(a.id(), old));
        assert_eq!(1, s.class_counts()[PriorityClass::Maximum.index()]);

        let (id, _) = picked_item(pick(&mut s, &mut rng));
        assert_eq!(a.id(), id);
    }

    #[test]
    fn large_class_is_walked_once_per_pick() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut s = RequestSelector::new(false, &hard());
        let urgent = get(PriorityClass::Maximum, create_chk_list(1));
        s.add_request(urgent.clone());
        let mut ids = Vec::new();
        for _ in 0..5000 {
            let r = get(PriorityClass::Update, create_chk_list(1));
            ids.push(r.id());
            s.add_request(r);
        }
        let favoured = ids[4321];
        s.note_success(favoured);
        s.note_success(urgent.id());

        assert_eq!(urgent.id(), picked_item(pick(&mut s, &mut rng)).0);
        assert_eq!(favoured, picked_item(pick(&mut s, &mut rng)).0);

        let mut seen = HashSet::new();
        while let Some(sel) = pick(&mut s, &mut rng) {
            assert!(seen.insert(picked_item(Some(sel)).0));
        }
        assert_eq!(4999, seen.len());
        assert!(!seen.contains(&favoured));
    }
}
