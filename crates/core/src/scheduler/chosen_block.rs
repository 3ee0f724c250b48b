//! A selected item, ready to hand to the network layer.

use super::selector::Selection;
use super::ClientRequestScheduler;
use blockswarm_api::*;
use std::sync::Arc;

/// Flags the network layer needs to send a [ChosenBlock].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockFlags {
    /// Only look in the local store.
    pub local_only: bool,
    /// Skip the local store.
    pub ignore_store: bool,
    /// The fetched block may be written to the client cache.
    pub can_write_client_cache: bool,
    /// Fork on reaching a node that can cache.
    pub fork_on_cacheable: bool,
    /// Send as real-time rather than bulk traffic.
    pub real_time: bool,
}

#[derive(Debug)]
enum InFlight {
    Key(NodeKey),
    Insert(RequestId, ItemToken),
}

/// Takes the item out of the fetching or running set when dropped.
#[derive(Debug)]
pub(crate) struct Release {
    scheduler: ClientRequestScheduler,
    target: InFlight,
}

impl Drop for Release {
    fn drop(&mut self) {
        match &self.target {
            InFlight::Key(key) => {
                self.scheduler.remove_fetching_key(key);
            }
            InFlight::Insert(id, item) => {
                self.scheduler.remove_running_insert(*id, *item);
            }
        }
        self.scheduler.wake_starter();
    }
}

/// One item chosen by [ClientRequestScheduler::grab_request], in flight
/// until exactly one of its completion callbacks is called.
///
/// Dropping a chosen block without completing it releases the item
/// without reporting anything, so it can be chosen again.
#[derive(Debug)]
pub struct ChosenBlock {
    key: NodeKey,
    client_key: Option<ClientKey>,
    token: Option<ItemToken>,
    flags: BlockFlags,
    persistence: Persistence,
    request: Option<SendableRequest>,
    scheduler: ClientRequestScheduler,
    release: Release,
}

impl ChosenBlock {
    pub(crate) fn new(scheduler: ClientRequestScheduler, selection: Selection) -> Self {
        let real_time = scheduler.id().traffic.is_real_time();
        match selection {
            Selection::Item { request, item } => {
                let fetch = request.fetch_flags();
                let target = if request.is_insert() {
                    InFlight::Insert(request.id(), item.token)
                } else {
                    InFlight::Key(item.key.clone())
                };
                Self {
                    key: item.key,
                    client_key: item.client_key,
                    token: Some(item.token),
                    flags: BlockFlags {
                        local_only: fetch.local_only,
                        ignore_store: fetch.ignore_store,
                        can_write_client_cache: fetch.can_write_client_cache,
                        fork_on_cacheable: fetch.fork_on_cacheable,
                        real_time,
                    },
                    persistence: request.persistence(),
                    request: Some(request),
                    release: Release {
                        scheduler: scheduler.clone(),
                        target,
                    },
                    scheduler,
                }
            }
            Selection::Offer { key } => Self {
                key: key.clone(),
                client_key: None,
                token: None,
                flags: BlockFlags {
                    real_time,
                    ..Default::default()
                },
                persistence: Persistence::Ephemeral,
                request: None,
                release: Release {
                    scheduler: scheduler.clone(),
                    target: InFlight::Key(key),
                },
                scheduler,
            },
        }
    }

    /// The low-level key to fetch or insert.
    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    /// The client-level key, if the item has one.
    pub fn client_key(&self) -> Option<&ClientKey> {
        self.client_key.as_ref()
    }

    /// The item token. `None` for an offered key.
    pub fn token(&self) -> Option<ItemToken> {
        self.token
    }

    /// Send flags.
    pub fn flags(&self) -> BlockFlags {
        self.flags
    }

    /// The persistence of the owning request. Offered keys are ephemeral.
    pub fn persistence(&self) -> Persistence {
        self.persistence
    }

    /// The owning request. `None` for an offered key.
    pub fn request(&self) -> Option<&SendableRequest> {
        self.request.as_ref()
    }

    /// The owning request's id. `None` for an offered key.
    pub fn request_id(&self) -> Option<RequestId> {
        self.request.as_ref().map(|r| r.id())
    }

    /// Returns true for insert items.
    pub fn is_insert(&self) -> bool {
        self.scheduler.id().is_insert()
    }

    /// Returns true if this fetches a key a peer offered, rather than an
    /// item of a registered request.
    pub fn is_offer(&self) -> bool {
        self.request.is_none()
    }

    /// The scheduler this item was chosen from.
    pub fn scheduler_id(&self) -> SchedulerId {
        self.scheduler.id()
    }

    /// Hand this block to the sender for its operation kind.
    pub fn send(self, senders: &RequestSenders) -> Dispatch {
        let sender = if self.is_insert() {
            &senders.insert
        } else {
            &senders.get
        };
        Dispatch {
            blocking: sender.blocks_thread(),
            fut: sender.send(self),
        }
    }

    /// The block was fetched.
    ///
    /// Only the requester is handed the block. Other gets listening for
    /// the key get it through [ClientRequestScheduler::trip_pending_key]
    /// when the block layer reports it. A fetched offered key is handed
    /// to every listener, and stays in flight until they all have it.
    pub fn on_fetch_success(self, block: KeyBlock) {
        let ChosenBlock {
            token,
            persistence,
            request,
            scheduler,
            release,
            ..
        } = self;

        let job_sched = scheduler.clone();
        let job: Job = Box::new(move || {
            let (Some(request), Some(item)) = (request, token) else {
                job_sched.trip(block, Some(Arc::new(release)));
                return false;
            };
            let _release = release;
            match &request {
                SendableRequest::Get(get) => {
                    if request.is_cancelled() {
                        job_sched.forget_item(request.id(), item);
                        if !request.has_item(item) {
                            return false;
                        }
                        request.deliver_failure(item, request.cancelled_error());
                        true
                    } else if request.has_item(item) {
                        get.on_success(item, block);
                        job_sched.succeeded(&request, item);
                        true
                    } else {
                        tracing::trace!("{} {item} already resolved", request.id());
                        false
                    }
                }
                SendableRequest::Insert(_) => {
                    job_sched.internal_error(
                        &request,
                        item,
                        "fetch success reported for an insert",
                    );
                    false
                }
            }
        });
        Self::queue(&scheduler, persistence, job);
    }

    /// The fetch failed.
    pub fn on_fetch_failure(self, err: LowLevelGetError) {
        if self.is_offer() {
            tracing::debug!("offered key {} failed: {err}", self.key);
            return;
        }
        if self.is_insert() {
            self.complete(move |scheduler, request, item| {
                scheduler.internal_error(
                    request,
                    item,
                    format!("fetch failure reported for an insert: {err}"),
                );
                false
            });
            return;
        }
        self.complete(move |scheduler, request, item| {
            scheduler.handle_failure(request, item, FetchError::translate(err).into());
            true
        });
    }

    /// The insert completed under `key`.
    pub fn on_insert_success(self, key: NodeKey) {
        self.complete(move |scheduler, request, item| match request {
            SendableRequest::Insert(insert) => {
                insert.on_success(item, key);
                scheduler.succeeded(request, item);
                true
            }
            SendableRequest::Get(_) => {
                scheduler.internal_error(
                    request,
                    item,
                    "insert success reported for a get",
                );
                false
            }
        });
    }

    /// The insert failed.
    pub fn on_insert_failure(self, err: LowLevelPutError) {
        if !self.is_insert() {
            self.complete(move |scheduler, request, item| {
                scheduler.internal_error(
                    request,
                    item,
                    format!("insert failure reported for a get: {err}"),
                );
                false
            });
            return;
        }
        self.complete(move |scheduler, request, item| {
            scheduler.handle_failure(request, item, InsertError::translate(err).into());
            true
        });
    }

    /// Run `outcome` on the request's job runner, unless the request was
    /// cancelled or no longer lists the item. The item is released after
    /// the outcome ran.
    fn complete<F>(self, outcome: F)
    where
        F: FnOnce(&ClientRequestScheduler, &SendableRequest, ItemToken) -> bool
            + 'static
            + Send,
    {
        let ChosenBlock {
            key,
            token,
            persistence,
            request,
            scheduler,
            release,
            ..
        } = self;
        let (Some(request), Some(item)) = (request, token) else {
            tracing::debug!("offered key {key} completed");
            return;
        };

        let job_sched = scheduler.clone();
        let job: Job = Box::new(move || {
            let _release = release;
            if request.is_cancelled() {
                job_sched.forget_item(request.id(), item);
                if !request.has_item(item) {
                    return false;
                }
                request.deliver_failure(item, request.cancelled_error());
                return true;
            }
            if !request.has_item(item) {
                tracing::trace!("{} {item} already resolved", request.id());
                return false;
            }
            outcome(&job_sched, &request, item)
        });
        Self::queue(&scheduler, persistence, job);
    }

    fn queue(scheduler: &ClientRequestScheduler, persistence: Persistence, job: Job) {
        if let Err(err) = scheduler.runner(persistence).queue(job, JobPriority::Normal) {
            tracing::warn!(
                "{}: could not queue completion, releasing: {err}",
                scheduler.id()
            );
        }
    }
}

/// Sends chosen blocks over the network.
#[cfg_attr(test, mockall::automock)]
pub trait RequestSender: 'static + Send + Sync + std::fmt::Debug {
    /// Send a block and call one of its completion callbacks once the
    /// outcome is known.
    fn send(&self, block: ChosenBlock) -> BoxFut<'static, ()>;

    /// Whether [RequestSender::send] does enough work that the request
    /// starter should run it in its own task.
    fn blocks_thread(&self) -> bool {
        false
    }
}

/// Trait-object [RequestSender].
pub type DynRequestSender = Arc<dyn RequestSender>;

/// The senders a request starter dispatches chosen blocks to.
#[derive(Debug, Clone)]
pub struct RequestSenders {
    /// Sends fetches.
    pub get: DynRequestSender,
    /// Sends inserts.
    pub insert: DynRequestSender,
}

/// A chosen block handed to its sender.
pub struct Dispatch {
    /// Run `fut` in its own task rather than inline.
    pub blocking: bool,
    /// Completes once the sender is done with the block.
    pub fut: BoxFut<'static, ()>,
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatch")
            .field("blocking", &self.blocking)
            .finish()
    }
}
