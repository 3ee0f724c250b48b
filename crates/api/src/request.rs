//! Sendable requests: the unit the scheduler operates on.
//!
//! A higher-level request (a multi-block download, an upload) decomposes
//! its work into one or more sendable requests. Each sendable request
//! exposes the items it still wants processed, its priority, and the
//! callbacks through which the scheduler reports per-item outcomes.
//!
//! The set of request kinds is closed: a [SendableRequest] is either a
//! [SendableGet] or a [SendableInsert]. The scheduler dispatches on the
//! variant rather than on an open hierarchy of hooks.

use crate::*;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// A shareable cancellation flag.
///
/// A parent request hands clones of its flag to all its sendable
/// requests, so cancelling the parent cancels every child. Cancellation
/// is a flag, not an interrupt: the scheduler checks it lazily.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Construct a new, not yet cancelled, flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns true once cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Attributes shared by all sendable requests.
#[derive(Debug)]
pub struct RequestCommon {
    id: RequestId,
    persistence: Persistence,
    traffic: TrafficClass,
    key_type: KeyType,
    priority: AtomicU8,
    cancel: CancelFlag,
    parent: Option<RequestId>,
    cooldown_notifications: bool,
}

impl RequestCommon {
    /// Construct the common attributes of a new request.
    pub fn new(
        persistence: Persistence,
        traffic: TrafficClass,
        key_type: KeyType,
        priority: PriorityClass,
    ) -> Self {
        Self {
            id: RequestId::next(),
            persistence,
            traffic,
            key_type,
            priority: AtomicU8::new(priority as u8),
            cancel: CancelFlag::new(),
            parent: None,
            cooldown_notifications: false,
        }
    }

    /// Attach this request to a parent, sharing its cancellation flag.
    pub fn with_parent(mut self, parent: RequestId, cancel: CancelFlag) -> Self {
        self.parent = Some(parent);
        self.cancel = cancel;
        self
    }

    /// Ask for [SendableGet::on_cooldown_changed] /
    /// [SendableInsert::on_cooldown_changed] notifications.
    pub fn with_cooldown_notifications(mut self) -> Self {
        self.cooldown_notifications = true;
        self
    }

    /// This request's id.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Durable or ephemeral.
    pub fn persistence(&self) -> Persistence {
        self.persistence
    }

    /// Real-time or bulk.
    pub fn traffic(&self) -> TrafficClass {
        self.traffic
    }

    /// The key type this request operates on.
    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// The owning parent request, if any.
    pub fn parent(&self) -> Option<RequestId> {
        self.parent
    }

    /// Current priority class.
    pub fn priority(&self) -> PriorityClass {
        PriorityClass::from_index(self.priority.load(Ordering::Acquire) as usize)
            .unwrap_or(PriorityClass::Minimum)
    }

    /// Change the priority class, returning the previous one.
    ///
    /// The scheduler only notices after `reregister_all` is called with
    /// the returned value.
    pub fn set_priority(&self, priority: PriorityClass) -> PriorityClass {
        let old = self.priority.swap(priority as u8, Ordering::AcqRel);
        PriorityClass::from_index(old as usize).unwrap_or(PriorityClass::Minimum)
    }

    /// Cancel this request (and, if the flag is shared, its siblings).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true once this request or its parent is cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the request wants cooldown notifications.
    pub fn wants_cooldown_notifications(&self) -> bool {
        self.cooldown_notifications
    }
}

/// One low-level key operation a request wants performed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestItem {
    /// The item token, unique within the owning request.
    pub token: ItemToken,

    /// The low-level key to fetch or insert.
    pub key: NodeKey,

    /// The client-level key, absent for raw low-level fetches.
    pub client_key: Option<ClientKey>,
}

impl RequestItem {
    /// Construct a raw low-level item.
    pub fn new(token: ItemToken, key: NodeKey) -> Self {
        Self {
            token,
            key,
            client_key: None,
        }
    }

    /// Construct an item with a client-level key.
    pub fn with_client_key(token: ItemToken, client_key: ClientKey) -> Self {
        Self {
            token,
            key: client_key.node_key.clone(),
            client_key: Some(client_key),
        }
    }
}

/// Locality and caching flags of a fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchFlags {
    /// Only look in the local store, never ask the network.
    pub local_only: bool,
    /// Skip the local store and go straight to the network.
    pub ignore_store: bool,
    /// Fetched blocks may be written to the client cache.
    pub can_write_client_cache: bool,
    /// Fork the request on reaching a node that can cache it.
    pub fork_on_cacheable: bool,
}

/// How often an item may fail with a retryable failure before the failure
/// is reported upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Some(3),
        }
    }
}

impl RetryPolicy {
    /// Never give up.
    pub const UNLIMITED: RetryPolicy = RetryPolicy { max_retries: None };

    /// Returns true if `retries` failed attempts exhaust this policy.
    pub fn is_exhausted(&self, retries: u32) -> bool {
        match self.max_retries {
            None => false,
            Some(max) => retries > max,
        }
    }
}

/// A fetch of one or more keys.
///
/// Implementations must be cheap to query: [SendableGet::list_items] is
/// called while the scheduler holds its lock, and must not call back into
/// the scheduler. Outcome callbacks are never called under that lock.
pub trait SendableGet: 'static + Send + Sync + std::fmt::Debug {
    /// Attributes shared by all requests.
    fn common(&self) -> &RequestCommon;

    /// The items still wanting a fetch. Empty once done.
    fn list_items(&self) -> Vec<RequestItem>;

    /// Locality and caching flags.
    fn fetch_flags(&self) -> FetchFlags {
        FetchFlags::default()
    }

    /// Retry budget per item.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    /// Called before registration. Return true if the data is already
    /// resolved and the request need not be scheduled.
    fn pre_register(&self) -> bool {
        false
    }

    /// An item's block arrived. The item should be dropped from
    /// [SendableGet::list_items].
    fn on_success(&self, item: ItemToken, block: KeyBlock);

    /// An item failed for good. The item should be dropped from
    /// [SendableGet::list_items].
    fn on_failure(&self, item: ItemToken, err: FetchError);

    /// The wake-up time of an item changed. Only called for requests
    /// created with cooldown notifications.
    fn on_cooldown_changed(&self, _item: ItemToken, _wakeup: Option<Timestamp>) {}
}

/// Trait-object [SendableGet].
pub type DynSendableGet = Arc<dyn SendableGet>;

/// An insert of one or more keys.
///
/// The same locking rules as [SendableGet] apply.
pub trait SendableInsert: 'static + Send + Sync + std::fmt::Debug {
    /// Attributes shared by all requests.
    fn common(&self) -> &RequestCommon;

    /// The items still wanting an insert. Empty once done.
    fn list_items(&self) -> Vec<RequestItem>;

    /// Retry budget per item.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    /// An item was inserted under `key`. The item should be dropped from
    /// [SendableInsert::list_items].
    fn on_success(&self, item: ItemToken, key: NodeKey);

    /// An item failed for good. The item should be dropped from
    /// [SendableInsert::list_items].
    fn on_failure(&self, item: ItemToken, err: InsertError);

    /// The wake-up time of an item changed. Only called for requests
    /// created with cooldown notifications.
    fn on_cooldown_changed(&self, _item: ItemToken, _wakeup: Option<Timestamp>) {}
}

/// Trait-object [SendableInsert].
pub type DynSendableInsert = Arc<dyn SendableInsert>;

/// A registered unit of work: a get or an insert.
#[derive(Debug, Clone)]
pub enum SendableRequest {
    /// A fetch.
    Get(DynSendableGet),
    /// An insert.
    Insert(DynSendableInsert),
}

impl SendableRequest {
    /// Attributes shared by all requests.
    pub fn common(&self) -> &RequestCommon {
        match self {
            Self::Get(g) => g.common(),
            Self::Insert(i) => i.common(),
        }
    }

    /// This request's id.
    pub fn id(&self) -> RequestId {
        self.common().id()
    }

    /// Fetch or insert.
    pub fn op_kind(&self) -> OpKind {
        match self {
            Self::Get(_) => OpKind::Fetch,
            Self::Insert(_) => OpKind::Insert,
        }
    }

    /// Returns true for inserts.
    pub fn is_insert(&self) -> bool {
        matches!(self, Self::Insert(_))
    }

    /// Durable or ephemeral.
    pub fn persistence(&self) -> Persistence {
        self.common().persistence()
    }

    /// Current priority class.
    pub fn priority(&self) -> PriorityClass {
        self.common().priority()
    }

    /// Returns true once cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.common().is_cancelled()
    }

    /// The scheduler this request belongs to.
    pub fn scheduler_id(&self) -> SchedulerId {
        let common = self.common();
        SchedulerId::new(common.key_type(), self.op_kind(), common.traffic())
    }

    /// The items still wanting processing.
    pub fn list_items(&self) -> Vec<RequestItem> {
        match self {
            Self::Get(g) => g.list_items(),
            Self::Insert(i) => i.list_items(),
        }
    }

    /// Returns true if the request still lists this item.
    pub fn has_item(&self, token: ItemToken) -> bool {
        self.list_items().iter().any(|i| i.token == token)
    }

    /// Retry budget per item.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::Get(g) => g.retry_policy(),
            Self::Insert(i) => i.retry_policy(),
        }
    }

    /// Fetch flags. Inserts have none set.
    pub fn fetch_flags(&self) -> FetchFlags {
        match self {
            Self::Get(g) => g.fetch_flags(),
            Self::Insert(_) => FetchFlags::default(),
        }
    }

    /// The cancellation outcome for this kind of request.
    pub fn cancelled_error(&self) -> RequestError {
        match self {
            Self::Get(_) => FetchError::cancelled().into(),
            Self::Insert(_) => InsertError::cancelled().into(),
        }
    }

    /// An internal-error outcome for this kind of request.
    pub fn internal_error(&self, message: impl Into<String>) -> RequestError {
        match self {
            Self::Get(_) => {
                FetchError::new(FetchErrorMode::InternalError, message).into()
            }
            Self::Insert(_) => {
                InsertError::new(InsertErrorMode::InternalError, message).into()
            }
        }
    }

    /// Report the final failure of an item.
    ///
    /// A failure of the wrong kind (an insert failure for a get) is a bug
    /// in the caller and is reported as an internal error.
    pub fn deliver_failure(&self, item: ItemToken, err: RequestError) {
        match (self, err) {
            (Self::Get(g), RequestError::Fetch(e)) => g.on_failure(item, e),
            (Self::Insert(i), RequestError::Insert(e)) => i.on_failure(item, e),
            (_, err) => {
                tracing::error!(
                    "mismatched failure kind for {}: {err}",
                    self.id()
                );
                let err = self.internal_error(err.to_string());
                self.deliver_failure(item, err);
            }
        }
    }

    /// Forward a wake-up time change, if the request asked for it.
    pub fn notify_cooldown(&self, item: ItemToken, wakeup: Option<Timestamp>) {
        if !self.common().wants_cooldown_notifications() {
            return;
        }
        match self {
            Self::Get(g) => g.on_cooldown_changed(item, wakeup),
            Self::Insert(i) => i.on_cooldown_changed(item, wakeup),
        }
    }
}

impl From<DynSendableGet> for SendableRequest {
    fn from(g: DynSendableGet) -> Self {
        Self::Get(g)
    }
}

impl From<DynSendableInsert> for SendableRequest {
    fn from(i: DynSendableInsert) -> Self {
        Self::Insert(i)
    }
}
