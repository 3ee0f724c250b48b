//! The client request scheduler.
//!
//! One [ClientRequestScheduler] exists per key type, operation kind and
//! traffic class. It owns the request selector and a durable and an
//! ephemeral key-listener tracker, all behind one mutex. That mutex is only
//! held for in-memory table work. Request callbacks never run under it.
//!
//! ### Outcomes
//!
//! Every outcome reaches a request through the job runner picked by the
//! request's persistence: the checkpointing runner for durable requests,
//! the immediate runner for ephemeral ones. The runners are chosen once,
//! when the scheduler is built.
//!
//! An outcome is only delivered if the request still lists the item, so
//! an item resolved by a tripped block is not reported a second time by a
//! late network completion.
//!
//! ### Failures
//!
//! - transient: the item cools down and is offered again later.
//! - retryable: the item cools down and consumes a retry. Once the
//!   request's retry policy is exhausted the failure is reported.
//! - fatal: the failure is reported at once.

use blockswarm_api::*;
use rand::{rngs::StdRng, SeedableRng};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

mod chosen_block;
pub use chosen_block::*;
use chosen_block::Release;

mod cooldown;
mod key_listener;
mod offered_keys;
mod selector;

use key_listener::KeyListenerTracker;
use selector::{Removed, RequestSelector};


/// CoreScheduler configuration types.
pub mod config {
    use blockswarm_api::{SwarmError, SwarmResult};

    /// How strictly priority classes are ordered.
    #[derive(
        Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
    )]
    #[serde(rename_all = "camelCase")]
    pub enum PriorityPolicy {
        /// A class is only served once every more urgent class has
        /// nothing eligible.
        Hard,
        /// Non-empty classes are occasionally skipped so that less urgent
        /// classes are not starved.
        Soft,
    }

    /// Configuration parameters for [ClientRequestScheduler](super::ClientRequestScheduler).
    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct CoreSchedulerConfig {
        /// Default: soft.
        pub priority_policy: PriorityPolicy,

        /// Under the soft policy, the percent chance of skipping past a
        /// non-empty class. Default: 10.
        pub soft_priority_skip_percent: u8,

        /// First cooldown after a failure. Default: 1 s.
        pub first_cooldown_ms: u32,

        /// Longest cooldown. Default: 30 min.
        pub last_cooldown_ms: u32,

        /// Number of steps from the first to the last cooldown. The
        /// interval doubles each step. Default: 8.
        pub num_cooldown_intervals: usize,

        /// Number of recently successful requests tried first within their
        /// class. Default: 16.
        pub max_recent_successes: usize,

        /// How long an offered key stays servable. Default: 10 min.
        pub offered_key_ttl_ms: u32,

        /// Maximum number of queued offered keys. Default: 1024.
        pub max_offered_keys: usize,

        /// Maximum number of chosen blocks the request starter keeps in
        /// flight per scheduler. Default: 16.
        pub starter_max_in_flight: usize,

        /// How often an idle request starter polls, in case a wake-up was
        /// missed. Default: 500 ms.
        pub starter_poll_interval_ms: u32,
    }

    impl Default for CoreSchedulerConfig {
        // Doubles from 1 s for 8 failures, then holds at 128 s.
        fn default() -> Self {
            Self {
                priority_policy: PriorityPolicy::Soft,
                soft_priority_skip_percent: 10,
                first_cooldown_ms: 1000,
                last_cooldown_ms: 1000 * 60 * 30,
                num_cooldown_intervals: 8,
                max_recent_successes: 16,
                offered_key_ttl_ms: 1000 * 60 * 10,
                max_offered_keys: 1024,
                starter_max_in_flight: 16,
                starter_poll_interval_ms: 500,
            }
        }
    }

    impl CoreSchedulerConfig {
        /// Check the parameters are usable.
        pub fn validate(&self) -> SwarmResult<()> {
            if self.soft_priority_skip_percent > 100 {
                return Err(SwarmError::other(
                    "coreScheduler.softPrioritySkipPercent must be at most 100",
                ));
            }
            if self.first_cooldown_ms > self.last_cooldown_ms {
                return Err(SwarmError::other(
                    "coreScheduler.firstCooldownMs must not exceed lastCooldownMs",
                ));
            }
            if self.num_cooldown_intervals == 0 {
                return Err(SwarmError::other(
                    "coreScheduler.numCooldownIntervals must be at least 1",
                ));
            }
            if self.starter_max_in_flight == 0 {
                return Err(SwarmError::other(
                    "coreScheduler.starterMaxInFlight must be at least 1",
                ));
            }
            Ok(())
        }
    }

    /// Module-level configuration for the core scheduler.
    #[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
    #[serde(default, rename_all = "camelCase")]
    pub struct CoreSchedulerModConfig {
        /// CoreScheduler configuration.
        pub core_scheduler: CoreSchedulerConfig,
    }
}

pub use config::*;

/// Queue sizes of a scheduler, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedRequestCount {
    /// Registered requests.
    pub total: usize,
    /// Registered requests per priority class, most urgent first.
    pub by_priority: [usize; PriorityClass::COUNT],
    /// Keys currently being fetched.
    pub fetching_keys: usize,
    /// Insert items currently running.
    pub running_inserts: usize,
    /// Offered keys waiting to be fetched.
    pub offered_keys: usize,
    /// Gets listening for keys, both persistences.
    pub listening: usize,
}

impl std::ops::AddAssign for QueuedRequestCount {
    fn add_assign(&mut self, rhs: Self) {
        self.total += rhs.total;
        for (a, b) in self.by_priority.iter_mut().zip(rhs.by_priority) {
            *a += b;
        }
        self.fetching_keys += rhs.fetching_keys;
        self.running_inserts += rhs.running_inserts;
        self.offered_keys += rhs.offered_keys;
        self.listening += rhs.listening;
    }
}

type CooldownNote = (SendableRequest, ItemToken, Option<Timestamp>);

#[derive(Debug)]
struct State {
    selector: RequestSelector,
    durable: KeyListenerTracker,
    ephemeral: KeyListenerTracker,
    waiters: HashMap<NodeKey, Vec<RequestId>>,
    rng: StdRng,
}

impl State {
    fn tracker(&self, persistence: Persistence) -> &KeyListenerTracker {
        match persistence {
            Persistence::Durable => &self.durable,
            Persistence::Ephemeral => &self.ephemeral,
        }
    }

    fn tracker_mut(&mut self, persistence: Persistence) -> &mut KeyListenerTracker {
        match persistence {
            Persistence::Durable => &mut self.durable,
            Persistence::Ephemeral => &mut self.ephemeral,
        }
    }

    /// Drop an item's cooldown and key listener once it has an outcome.
    fn forget(&mut self, id: RequestId, item: ItemToken) {
        self.selector.cooldown.remove_item(id, item);
        self.durable.remove_item(id, item);
        self.ephemeral.remove_item(id, item);
    }

    /// Wake every cooling item of a registered request.
    fn wake_request(&mut self, id: RequestId, now: Timestamp) -> Vec<CooldownNote> {
        let Some(request) = self.selector.get(id).cloned() else {
            return Vec::new();
        };
        self.selector
            .cooldown
            .wake_request(id, now)
            .into_iter()
            .map(|item| (request.clone(), item, None))
            .collect()
    }
}

#[derive(Debug)]
struct Inner {
    id: SchedulerId,
    config: CoreSchedulerConfig,
    state: Mutex<State>,
    durable_runner: DynJobRunner,
    ephemeral_runner: DynJobRunner,
    datastore_checker: DynDatastoreChecker,
    wake: Notify,
}

/// Schedules the low-level operations of one key type, operation kind and
/// traffic class.
///
/// Cheap to clone. All clones share the same state.
#[derive(Debug, Clone)]
pub struct ClientRequestScheduler(Arc<Inner>);

impl ClientRequestScheduler {
    /// Construct a scheduler. Requests registered with it use
    /// `durable_runner` or `ephemeral_runner` according to their
    /// persistence.
    pub fn new(
        id: SchedulerId,
        config: CoreSchedulerConfig,
        durable_runner: DynJobRunner,
        ephemeral_runner: DynJobRunner,
        datastore_checker: DynDatastoreChecker,
    ) -> Self {
        let state = State {
            selector: RequestSelector::new(id.is_insert(), &config),
            durable: KeyListenerTracker::new(Persistence::Durable),
            ephemeral: KeyListenerTracker::new(Persistence::Ephemeral),
            waiters: HashMap::new(),
            rng: StdRng::from_entropy(),
        };
        Self(Arc::new(Inner {
            id,
            config,
            state: Mutex::new(state),
            durable_runner,
            ephemeral_runner,
            datastore_checker,
            wake: Notify::new(),
        }))
    }

    /// Which requests this scheduler serves.
    pub fn id(&self) -> SchedulerId {
        self.0.id
    }

    /// The configuration this scheduler was built with.
    pub fn config(&self) -> &CoreSchedulerConfig {
        &self.0.config
    }

    /// The job runner used for requests of the given persistence.
    pub fn runner(&self, persistence: Persistence) -> &DynJobRunner {
        match persistence {
            Persistence::Durable => &self.0.durable_runner,
            Persistence::Ephemeral => &self.0.ephemeral_runner,
        }
    }

    /// Register an insert.
    ///
    /// Fails if this is a fetch scheduler, or if the insert belongs to a
    /// different scheduler.
    pub fn register_insert(&self, insert: DynSendableInsert) -> SwarmResult<()> {
        if !self.0.id.is_insert() {
            tracing::error!("{}: register_insert on a fetch scheduler", self.0.id);
            return Err(SwarmError::other(format!(
                "cannot register an insert with fetch scheduler {}",
                self.0.id
            )));
        }
        let request = SendableRequest::Insert(insert);
        self.check_owner(&request)?;

        let id = request.id();
        if request.is_cancelled() {
            tracing::debug!("{}: not registering cancelled insert {id}", self.0.id);
            return Ok(());
        }

        if self.0.state.lock().unwrap().selector.add_request(request) {
            tracing::debug!("{}: registered insert {id}", self.0.id);
            self.wake_starter();
        } else {
            tracing::warn!("{}: insert {id} already registered", self.0.id);
        }
        Ok(())
    }

    /// Register a group of gets of the same persistence.
    ///
    /// Cancelled gets and gets whose pre-registration hook reports the
    /// data as resolved are skipped. Unless `skip_store_check` is set, each
    /// get is first checked against `block_set` and the datastore, and
    /// only enters selection once that check completes.
    ///
    /// Fails if this is an insert scheduler, or if a get belongs to a
    /// different scheduler or persistence. Nothing is registered then.
    pub fn register(
        &self,
        getters: Vec<DynSendableGet>,
        persistence: Persistence,
        block_set: Option<Arc<BlockSet>>,
        skip_store_check: bool,
    ) -> SwarmResult<()> {
        if self.0.id.is_insert() {
            tracing::error!("{}: register of gets on an insert scheduler", self.0.id);
            return Err(SwarmError::other(format!(
                "cannot register gets with insert scheduler {}",
                self.0.id
            )));
        }
        for get in &getters {
            self.check_owner(&SendableRequest::Get(get.clone()))?;
            let actual = get.common().persistence();
            if actual != persistence {
                tracing::error!(
                    "{}: get {} is {actual:?}, registered as {persistence:?}",
                    self.0.id,
                    get.common().id()
                );
                return Err(SwarmError::other(format!(
                    "get {} has persistence {actual:?}, not {persistence:?}",
                    get.common().id()
                )));
            }
        }

        let eligible: Vec<DynSendableGet> = getters
            .into_iter()
            .filter(|get| {
                let id = get.common().id();
                if get.common().is_cancelled() {
                    tracing::debug!("{}: not registering cancelled get {id}", self.0.id);
                    return false;
                }
                if get.pre_register() {
                    tracing::debug!("{}: get {id} already resolved", self.0.id);
                    return false;
                }
                true
            })
            .collect();

        if eligible.is_empty() {
            tracing::debug!("{}: no eligible gets to register", self.0.id);
            return Ok(());
        }

        let rt = if skip_store_check {
            None
        } else {
            Some(tokio::runtime::Handle::try_current().map_err(|err| {
                SwarmError::other_src("store check needs an async runtime", err)
            })?)
        };

        {
            let mut state = self.0.state.lock().unwrap();
            let tracker = state.tracker_mut(persistence);
            for get in &eligible {
                if !tracker.add_request(get) {
                    tracing::warn!(
                        "{}: get {} already listening",
                        self.0.id,
                        get.common().id()
                    );
                }
            }
        }

        let Some(rt) = rt else {
            self.finish_register(eligible);
            return Ok(());
        };

        for get in eligible {
            let this = self.clone();
            let check = self
                .0
                .datastore_checker
                .queue_request(get.clone(), block_set.clone());
            rt.spawn(async move {
                match check.await {
                    Ok(res) if !res.found.is_empty() => {
                        this.deliver_store_hits(get, res.found)
                    }
                    Ok(_) => this.finish_register(vec![get]),
                    Err(err) => {
                        tracing::warn!(
                            "{}: store check for {} failed: {err}",
                            this.0.id,
                            get.common().id()
                        );
                        this.finish_register(vec![get]);
                    }
                }
            });
        }
        Ok(())
    }

    fn deliver_store_hits(&self, get: DynSendableGet, found: Vec<(ItemToken, KeyBlock)>) {
        let persistence = get.common().persistence();
        let id = get.common().id();
        {
            let mut state = self.0.state.lock().unwrap();
            let tracker = state.tracker_mut(persistence);
            for (_, block) in &found {
                tracker.remove_key(id, &block.key);
            }
        }
        tracing::debug!("{}: {} blocks of {id} found locally", self.0.id, found.len());

        let this = self.clone();
        let job_get = get.clone();
        let queued = self.run_job(
            persistence,
            JobPriority::Normal,
            Box::new(move || {
                if !job_get.common().is_cancelled() {
                    let request = SendableRequest::Get(job_get.clone());
                    for (item, block) in found {
                        if request.has_item(item) {
                            job_get.on_success(item, block);
                        }
                    }
                }
                this.finish_register(vec![job_get]);
                true
            }),
        );
        if !queued {
            self.finish_register(vec![get]);
        }
    }

    fn finish_register(&self, getters: Vec<DynSendableGet>) {
        let mut added = 0;
        let mut cancelled = Vec::new();
        {
            let mut state = self.0.state.lock().unwrap();
            for get in getters {
                let id = get.common().id();
                let persistence = get.common().persistence();
                if !state.tracker(persistence).contains(id) {
                    tracing::debug!("{}: {id} removed before registration finished", self.0.id);
                    continue;
                }
                if get.common().is_cancelled() {
                    state.tracker_mut(persistence).remove_request(id);
                    cancelled.push(SendableRequest::Get(get));
                    continue;
                }
                if get.list_items().is_empty() {
                    state.tracker_mut(persistence).remove_request(id);
                    continue;
                }
                if state.selector.add_request(SendableRequest::Get(get)) {
                    added += 1;
                } else {
                    tracing::warn!("{}: get {id} already registered", self.0.id);
                }
            }
        }
        for request in cancelled {
            let items = request.list_items().into_iter().map(|i| i.token).collect();
            self.deliver_cancelled(request, items);
        }
        if added > 0 {
            tracing::debug!("{}: registered {added} gets", self.0.id);
            self.wake_starter();
        }
    }

    /// Choose the next item to send, accepting offered keys.
    pub fn grab_request(&self) -> Option<ChosenBlock> {
        self.grab_request_at(Timestamp::now(), true)
    }

    /// Choose the next item to send, as of `now`.
    ///
    /// The chosen key (or insert item) is marked in flight before this
    /// returns, so concurrent callers never choose it twice. It is
    /// released by the [ChosenBlock]'s completion callback, or when the
    /// chosen block is dropped.
    pub fn grab_request_at(
        &self,
        now: Timestamp,
        accept_offers: bool,
    ) -> Option<ChosenBlock> {
        let outcome = {
            let mut lock = self.0.state.lock().unwrap();
            let State {
                selector,
                durable,
                ephemeral,
                rng,
                ..
            } = &mut *lock;
            let outcome = selector.choose_request(
                now,
                accept_offers,
                |key| {
                    [durable.priority_for(key), ephemeral.priority_for(key)]
                        .into_iter()
                        .flatten()
                        .min()
                },
                rng,
            );
            for removed in &outcome.removed {
                if !removed.request.is_insert() {
                    durable.remove_request(removed.request.id());
                    ephemeral.remove_request(removed.request.id());
                }
            }
            outcome
        };

        for Removed {
            request,
            cancelled,
            idle_items,
        } in outcome.removed
        {
            if !request.is_insert() {
                self.0.datastore_checker.remove_request(request.id());
            }
            if cancelled {
                self.deliver_cancelled(request, idle_items);
            }
        }

        let chosen = ChosenBlock::new(self.clone(), outcome.selection?);
        tracing::trace!("{}: chose {}", self.0.id, chosen.key());
        Some(chosen)
    }

    /// A block for `block.key` arrived from the network or the store.
    ///
    /// Every get listening for the key is handed the block through its
    /// job runner, and the key leaves the offered-keys queue. Returns the
    /// number of listening items.
    pub fn trip_pending_key(&self, block: KeyBlock) -> usize {
        self.trip(block, None)
    }

    /// Trip `block.key`. `hold` stays alive until every listener's
    /// delivery job has run.
    pub(crate) fn trip(&self, block: KeyBlock, hold: Option<Arc<Release>>) -> usize {
        let now = Timestamp::now();
        let (durable, ephemeral, notes) = {
            let mut state = self.0.state.lock().unwrap();
            state.selector.offered.dequeue(&block.key);
            let durable = state.durable.take_matches(&block.key);
            let ephemeral = state.ephemeral.take_matches(&block.key);
            let mut notes = Vec::new();
            for (get, item) in durable.iter().chain(ephemeral.iter()) {
                let id = get.common().id();
                state.selector.cooldown.remove_item(id, *item);
                notes.extend(state.wake_request(id, now));
            }
            (durable, ephemeral, notes)
        };

        let count = durable.len() + ephemeral.len();
        for (persistence, matches) in [
            (Persistence::Durable, durable),
            (Persistence::Ephemeral, ephemeral),
        ] {
            if matches.is_empty() {
                continue;
            }
            let block = block.clone();
            let hold = hold.clone();
            self.run_job(
                persistence,
                JobPriority::Normal,
                Box::new(move || {
                    let _hold = hold;
                    let mut dirty = false;
                    for (get, item) in matches {
                        if get.common().is_cancelled() {
                            continue;
                        }
                        if get.list_items().iter().any(|i| i.token == item) {
                            get.on_success(item, block.clone());
                            dirty = true;
                        }
                    }
                    dirty
                }),
            );
        }
        self.notify_cooldowns(notes);
        if count > 0 {
            tracing::trace!("{}: tripped {} for {count} items", self.0.id, block.key);
        }
        count
    }

    /// Release an insert item from the running set.
    pub fn remove_running_insert(&self, id: RequestId, item: ItemToken) -> bool {
        let removed = self
            .0
            .state
            .lock()
            .unwrap()
            .selector
            .remove_running_insert(id, item);
        if !removed {
            tracing::warn!("{}: insert {id} {item} was not running", self.0.id);
        }
        removed
    }

    /// Release a key from the fetching set. Requests that asked to be
    /// told via [ClientRequestScheduler::has_fetching_key_for] are woken.
    pub fn remove_fetching_key(&self, key: &NodeKey) -> bool {
        let now = Timestamp::now();
        let (removed, notes) = {
            let mut state = self.0.state.lock().unwrap();
            let removed = state.selector.remove_fetching_key(key);
            let mut notes = Vec::new();
            for id in state.waiters.remove(key).unwrap_or_default() {
                notes.extend(state.wake_request(id, now));
            }
            (removed, notes)
        };
        if !removed {
            tracing::warn!("{}: {key} was not being fetched", self.0.id);
        }
        self.notify_cooldowns(notes);
        removed
    }

    /// An item of `request` completed. The request is preferred within its
    /// class for a while, and its cooling items become eligible at once.
    pub fn succeeded(&self, request: &SendableRequest, item: ItemToken) {
        let id = request.id();
        let notes = {
            let mut state = self.0.state.lock().unwrap();
            state.forget(id, item);
            state.selector.note_success(id);
            state.wake_request(id, Timestamp::now())
        };
        self.notify_cooldowns(notes);
    }

    /// Report the final failure of an item through the request's job
    /// runner.
    pub fn call_failure(
        &self,
        request: SendableRequest,
        item: ItemToken,
        err: RequestError,
    ) {
        let this = self.clone();
        self.run_job(
            request.persistence(),
            JobPriority::Normal,
            Box::new(move || {
                this.forget_item(request.id(), item);
                if !request.has_item(item) {
                    return false;
                }
                request.deliver_failure(item, err);
                true
            }),
        );
    }

    /// Apply the failure policy to a failed item. Must be called from the
    /// request's job runner.
    pub fn handle_failure(
        &self,
        request: &SendableRequest,
        item: ItemToken,
        err: RequestError,
    ) {
        enum Verdict {
            Report,
            Cooling(Timestamp, u32),
            Ignore,
        }

        let id = request.id();
        let class = err.class();
        let policy = request.retry_policy();
        let now = Timestamp::now();
        let verdict = {
            let mut state = self.0.state.lock().unwrap();
            match class {
                FailureClass::Fatal => {
                    state.forget(id, item);
                    Verdict::Report
                }
                _ if !state.selector.contains(id) => Verdict::Ignore,
                FailureClass::Transient => {
                    let (wakeup, retries) = state
                        .selector
                        .cooldown
                        .cool_down(id, item, now, false);
                    Verdict::Cooling(wakeup, retries)
                }
                FailureClass::Retryable => {
                    let (wakeup, retries) = state
                        .selector
                        .cooldown
                        .cool_down(id, item, now, true);
                    if policy.is_exhausted(retries) {
                        state.forget(id, item);
                        Verdict::Report
                    } else {
                        Verdict::Cooling(wakeup, retries)
                    }
                }
            }
        };

        match verdict {
            Verdict::Report => {
                tracing::debug!("{}: {id} {item} failed: {err}", self.0.id);
                request.deliver_failure(item, err);
            }
            Verdict::Cooling(wakeup, retries) => {
                tracing::debug!(
                    "{}: {id} {item} cooling down after {err} (retries: {retries})",
                    self.0.id
                );
                request.notify_cooldown(item, Some(wakeup));
            }
            Verdict::Ignore => {
                tracing::debug!("{}: {id} no longer registered, dropping {err}", self.0.id);
            }
        }
    }

    /// Report a failure that is not specific to the key, such as a bug in
    /// this scheduler. Logged at error level and delivered to the item as
    /// an internal error, ahead of other queued jobs.
    pub fn internal_error(
        &self,
        request: &SendableRequest,
        item: ItemToken,
        err: impl std::fmt::Display,
    ) {
        let message = err.to_string();
        tracing::error!(
            "{}: internal error on {} {item}: {message}",
            self.0.id,
            request.id()
        );
        let this = self.clone();
        let request = request.clone();
        self.run_job(
            request.persistence(),
            JobPriority::High,
            Box::new(move || {
                this.forget_item(request.id(), item);
                if !request.has_item(item) {
                    return false;
                }
                let err = request.internal_error(message);
                request.deliver_failure(item, err);
                true
            }),
        );
    }

    /// Returns true if any get, durable or ephemeral, listens for `key`.
    pub fn want_key(&self, key: &NodeKey) -> bool {
        let state = self.0.state.lock().unwrap();
        state.durable.want_key(key) || state.ephemeral.want_key(key)
    }

    /// Returns true if `key` is being fetched.
    pub fn has_fetching_key(&self, key: &NodeKey) -> bool {
        self.0
            .state
            .lock()
            .unwrap()
            .selector
            .fetching_entry(key)
            .is_some()
    }

    /// Returns true if `key` is being fetched.
    ///
    /// If `requester` is a get of the given persistence registered here,
    /// and the fetch is on behalf of someone else, the requester's cooling
    /// items are woken once that fetch ends.
    pub fn has_fetching_key_for(
        &self,
        key: &NodeKey,
        requester: Option<RequestId>,
        persistence: Persistence,
    ) -> bool {
        let mut state = self.0.state.lock().unwrap();
        let Some(entry) = state.selector.fetching_entry(key) else {
            return false;
        };
        if let Some(id) = requester {
            if entry.request != Some(id) && state.tracker(persistence).contains(id) {
                let waiters = state.waiters.entry(key.clone()).or_default();
                if !waiters.contains(&id) {
                    waiters.push(id);
                }
            }
        }
        true
    }

    /// Re-file a request whose priority changed from `old_priority`.
    pub fn reregister_all(
        &self,
        request: &SendableRequest,
        old_priority: PriorityClass,
    ) -> bool {
        let found = self
            .0
            .state
            .lock()
            .unwrap()
            .selector
            .reregister(request.id(), old_priority);
        if found {
            self.wake_starter();
        } else {
            tracing::warn!(
                "{}: {} not found when changing priority",
                self.0.id,
                request.id()
            );
        }
        found
    }

    /// Stop listening for `keys` on behalf of a get. Returns how many
    /// listeners were removed.
    pub fn remove_pending_keys(&self, id: RequestId, keys: &[NodeKey]) -> usize {
        let mut removed = 0;
        {
            let mut state = self.0.state.lock().unwrap();
            for key in keys {
                if state.durable.remove_key(id, key) {
                    removed += 1;
                }
                if state.ephemeral.remove_key(id, key) {
                    removed += 1;
                }
            }
        }
        if removed == 0 && !keys.is_empty() {
            tracing::warn!("{}: no listeners of {id} found for removal", self.0.id);
        }
        removed
    }

    /// Remove a request entirely: from selection, from the key listeners
    /// and from the store-check queue. Items already in flight complete
    /// normally.
    pub fn unregister(&self, id: RequestId) -> bool {
        let found = {
            let mut state = self.0.state.lock().unwrap();
            let selected = state.selector.remove_request(id).is_some();
            let durable = state.durable.remove_request(id);
            let ephemeral = state.ephemeral.remove_request(id);
            selected || durable || ephemeral
        };
        if !self.0.id.is_insert() {
            self.0.datastore_checker.remove_request(id);
        }
        if found {
            tracing::debug!("{}: unregistered {id}", self.0.id);
        } else {
            tracing::warn!("{}: {id} not found on removal", self.0.id);
        }
        found
    }

    /// Queue a key a peer offered to send. Returns false if the key was
    /// already queued or this scheduler does not fetch such keys.
    pub fn queue_offered_key(&self, key: NodeKey) -> bool {
        if self.0.id.is_insert() || key.key_type != self.0.id.key_type {
            tracing::warn!("{}: cannot queue offered key {key}", self.0.id);
            return false;
        }
        let queued = self
            .0
            .state
            .lock()
            .unwrap()
            .selector
            .offered
            .queue(key, Timestamp::now());
        if queued {
            self.wake_starter();
        }
        queued
    }

    /// Forget an offered key. Returns false if it was not queued.
    pub fn dequeue_offered_key(&self, key: &NodeKey) -> bool {
        self.0.state.lock().unwrap().selector.offered.dequeue(key)
    }

    /// Queue sizes, for diagnostics.
    pub fn count_queued_requests(&self) -> QueuedRequestCount {
        let state = self.0.state.lock().unwrap();
        let by_priority = state.selector.class_counts();
        QueuedRequestCount {
            total: by_priority.iter().sum(),
            by_priority,
            fetching_keys: state.selector.fetching_count(),
            running_inserts: state.selector.running_insert_count(),
            offered_keys: state.selector.offered.len(),
            listening: state.durable.len() + state.ephemeral.len(),
        }
    }

    /// The earliest future time a cooling item becomes eligible.
    pub fn next_wakeup(&self) -> Option<Timestamp> {
        self.0
            .state
            .lock()
            .unwrap()
            .selector
            .cooldown
            .next_wakeup(Timestamp::now())
    }

    /// When a cooling item becomes eligible again. `None` if the item has
    /// not failed, or its cooldown was cleared by a success.
    pub fn wakeup_time(
        &self,
        request: &SendableRequest,
        item: ItemToken,
    ) -> Option<Timestamp> {
        self.0
            .state
            .lock()
            .unwrap()
            .selector
            .cooldown
            .wakeup_time(request.id(), item)
    }

    /// Bring an item's wake-up time forward. Returns false if the item is
    /// not cooling down until later than `wakeup`.
    pub fn reduce_wakeup_time(
        &self,
        request: &SendableRequest,
        item: ItemToken,
        wakeup: Timestamp,
    ) -> bool {
        let changed = self
            .0
            .state
            .lock()
            .unwrap()
            .selector
            .cooldown
            .reduce_wakeup_time(request.id(), item, wakeup);
        let Some(wakeup) = changed else {
            return false;
        };
        self.notify_cooldowns(vec![(request.clone(), item, Some(wakeup))]);
        self.wake_starter();
        true
    }

    /// Make a cooling item eligible now.
    pub fn clear_wakeup_time(&self, request: &SendableRequest, item: ItemToken) -> bool {
        let changed = self
            .0
            .state
            .lock()
            .unwrap()
            .selector
            .cooldown
            .reduce_wakeup_time(request.id(), item, Timestamp::now());
        if changed.is_none() {
            return false;
        }
        self.notify_cooldowns(vec![(request.clone(), item, None)]);
        self.wake_starter();
        true
    }

    /// Hint the request starter that something may be eligible.
    pub fn wake_starter(&self) {
        self.0.wake.notify_one();
    }

    /// Wait for a [ClientRequestScheduler::wake_starter] hint. A hint given
    /// while nobody waits is kept for the next waiter.
    pub async fn wait_for_wake(&self) {
        self.0.wake.notified().await;
    }

    fn check_owner(&self, request: &SendableRequest) -> SwarmResult<()> {
        let owner = request.scheduler_id();
        if owner == self.0.id {
            return Ok(());
        }
        tracing::error!("{}: {} belongs to {owner}", self.0.id, request.id());
        Err(SwarmError::other(format!(
            "request {} belongs to scheduler {owner}, not {}",
            request.id(),
            self.0.id
        )))
    }

    fn forget_item(&self, id: RequestId, item: ItemToken) {
        self.0.state.lock().unwrap().forget(id, item);
    }

    fn deliver_cancelled(&self, request: SendableRequest, items: Vec<ItemToken>) {
        if items.is_empty() {
            return;
        }
        self.run_job(
            request.persistence(),
            JobPriority::Normal,
            Box::new(move || {
                let mut dirty = false;
                for item in items {
                    if request.has_item(item) {
                        request.deliver_failure(item, request.cancelled_error());
                        dirty = true;
                    }
                }
                dirty
            }),
        );
    }

    fn notify_cooldowns(&self, notes: Vec<CooldownNote>) {
        for (request, item, wakeup) in notes {
            if !request.common().wants_cooldown_notifications() {
                continue;
            }
            self.run_job(
                request.persistence(),
                JobPriority::Low,
                Box::new(move || {
                    request.notify_cooldown(item, wakeup);
                    false
                }),
            );
        }
    }

    fn run_job(&self, persistence: Persistence, priority: JobPriority, job: Job) -> bool {
        match self.runner(persistence).queue(job, priority) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!("{}: could not queue job: {err}", self.0.id);
                false
            }
        }
    }
}
