//! The full set of schedulers, one per key type, operation kind and
//! traffic class.

use crate::scheduler::*;
use blockswarm_api::*;
use std::collections::HashMap;
use std::sync::Arc;

/// Holds every [ClientRequestScheduler] of a node, sharing one durable
/// job runner, one ephemeral job runner and one datastore checker.
#[derive(Debug, Clone)]
pub struct SchedulerRegistry {
    schedulers: HashMap<SchedulerId, ClientRequestScheduler>,
}

impl SchedulerRegistry {
    /// Build every scheduler from the builder's factories and the
    /// `coreScheduler` module config.
    pub async fn create(builder: Arc<Builder>) -> SwarmResult<Self> {
        let config = builder
            .config
            .get_module_config::<CoreSchedulerModConfig>()?
            .core_scheduler;
        config.validate()?;

        let (durable, ephemeral, checker) = futures::future::try_join3(
            builder
                .job_runner
                .create(builder.clone(), Persistence::Durable),
            builder
                .job_runner
                .create(builder.clone(), Persistence::Ephemeral),
            builder.datastore_checker.create(builder.clone()),
        )
        .await?;

        let schedulers = SchedulerId::all()
            .into_iter()
            .map(|id| {
                let scheduler = ClientRequestScheduler::new(
                    id,
                    config.clone(),
                    durable.clone(),
                    ephemeral.clone(),
                    checker.clone(),
                );
                (id, scheduler)
            })
            .collect::<HashMap<_, _>>();

        tracing::info!("created {} request schedulers", schedulers.len());

        Ok(Self { schedulers })
    }

    /// The scheduler with the given id.
    pub fn get(&self, id: SchedulerId) -> Option<&ClientRequestScheduler> {
        self.schedulers.get(&id)
    }

    /// The scheduler for a key type, operation kind and traffic class.
    pub fn scheduler(
        &self,
        key_type: KeyType,
        op_kind: OpKind,
        traffic: TrafficClass,
    ) -> Option<&ClientRequestScheduler> {
        self.get(SchedulerId::new(key_type, op_kind, traffic))
    }

    /// The scheduler a request must be registered with.
    pub fn for_request(
        &self,
        request: &SendableRequest,
    ) -> Option<&ClientRequestScheduler> {
        self.get(request.scheduler_id())
    }

    /// Iterate every scheduler.
    pub fn iter(&self) -> impl Iterator<Item = &ClientRequestScheduler> {
        self.schedulers.values()
    }

    fn fetchers(
        &self,
        key_type: KeyType,
    ) -> impl Iterator<Item = &ClientRequestScheduler> {
        TrafficClass::ALL.into_iter().filter_map(move |traffic| {
            self.scheduler(key_type, OpKind::Fetch, traffic)
        })
    }

    /// Queue a key a peer offered to the fetch scheduler of its key type
    /// and the given traffic class.
    pub fn queue_offered_key(&self, key: NodeKey, real_time: bool) -> bool {
        let traffic = TrafficClass::from_real_time(real_time);
        match self.scheduler(key.key_type, OpKind::Fetch, traffic) {
            Some(scheduler) => scheduler.queue_offered_key(key),
            None => false,
        }
    }

    /// Forget an offered key in every fetch scheduler of its key type.
    pub fn dequeue_offered_key(&self, key: &NodeKey) -> bool {
        let mut found = false;
        for scheduler in self.fetchers(key.key_type) {
            found |= scheduler.dequeue_offered_key(key);
        }
        found
    }

    /// Hand a block to every get listening for it, in both traffic
    /// classes. Returns the number of listening items.
    pub fn trip_pending_key(&self, block: KeyBlock) -> usize {
        self.fetchers(block.key.key_type)
            .map(|scheduler| scheduler.trip_pending_key(block.clone()))
            .sum()
    }

    /// Returns true if any get, in either traffic class, wants `key`.
    pub fn want_key(&self, key: &NodeKey) -> bool {
        self.fetchers(key.key_type).any(|s| s.want_key(key))
    }

    /// Queue sizes summed over every scheduler.
    pub fn count_queued_requests(&self) -> QueuedRequestCount {
        let mut out = QueuedRequestCount::default();
        for scheduler in self.iter() {
            out += scheduler.count_queued_requests();
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use blockswarm_test_utils::{id::create_chk_list, request::*};

    async fn registry() -> SchedulerRegistry {
        let builder = crate::default_test_builder()
            .with_default_config()
            .unwrap()
            .build();
        SchedulerRegistry::create(builder).await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn one_scheduler_per_id() {
        let reg = registry().await;
        assert_eq!(8, reg.iter().count());
        for id in SchedulerId::all() {
            assert_eq!(id, reg.get(id).unwrap().id());
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_config_is_rejected() {
        let builder = crate::default_test_builder()
            .with_default_config()
            .unwrap();
        builder
            .config
            .set_module_config(&CoreSchedulerModConfig {
                core_scheduler: CoreSchedulerConfig {
                    num_cooldown_intervals: 0,
                    ..Default::default()
                },
            })
            .unwrap();
        assert!(SchedulerRegistry::create(builder.build()).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn config_loads_from_json() {
        let mut builder = crate::default_builder();
        builder.config = serde_json::from_str(
            r#"{ "coreScheduler": { "priorityPolicy": "hard", "maxOfferedKeys": 3 } }"#,
        )
        .unwrap();
        let builder = builder.with_default_config().unwrap().build();
        let reg = SchedulerRegistry::create(builder).await.unwrap();

        let config = reg.iter().next().unwrap().config().clone();
        assert_eq!(PriorityPolicy::Hard, config.priority_policy);
        assert_eq!(3, config.max_offered_keys);
        assert_eq!(CoreSchedulerConfig::default().first_cooldown_ms, config.first_cooldown_ms);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queued_counts_serialize_camel_case() {
        let reg = registry().await;
        let json = serde_json::to_value(reg.count_queued_requests()).unwrap();
        assert_eq!(0, json["fetchingKeys"]);
        assert_eq!(7, json["byPriority"].as_array().unwrap().len());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn routes_requests_and_offers() {
        let reg = registry().await;
        let keys = create_chk_list(1);
        let (_, get) = TestGet::new(
            test_common(Persistence::Ephemeral, PriorityClass::Update),
            keys.clone(),
        )
        .build();
        let request = SendableRequest::Get(get.clone());
        let scheduler = reg.for_request(&request).unwrap();
        assert_eq!(request.scheduler_id(), scheduler.id());

        scheduler
            .register(vec![get], Persistence::Ephemeral, None, true)
            .unwrap();
        assert!(reg.want_key(&keys[0]));
        assert_eq!(1, reg.count_queued_requests().total);

        assert!(reg.queue_offered_key(keys[0].clone(), true));
        assert_eq!(1, reg.count_queued_requests().offered_keys);
        assert!(reg.dequeue_offered_key(&keys[0]));
        assert!(!reg.dequeue_offered_key(&keys[0]));
    }
}
