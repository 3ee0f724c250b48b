use blockswarm_api::*;
use blockswarm_core::{default_test_builder, registry::SchedulerRegistry};
use blockswarm_test_utils::{enable_tracing, id::create_chk_list, iter_check, request::*};

async fn registry() -> SchedulerRegistry {
    let builder = default_test_builder().with_default_config().unwrap().build();
    SchedulerRegistry::create(builder).await.unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn durable_get_retries_after_cooldown_then_ephemeral_get_fetches() {
    enable_tracing();

    let reg = registry().await;
    let keys = create_chk_list(1);
    let key = keys[0].clone();

    let (durable, dyn_durable) = TestGet::new(
        test_common(Persistence::Durable, PriorityClass::Maximum),
        keys.clone(),
    )
    .build();
    let (ephemeral, dyn_ephemeral) = TestGet::new(
        test_common(Persistence::Ephemeral, PriorityClass::Interactive),
        keys,
    )
    .build();
    let durable_id = dyn_durable.common().id();
    let ephemeral_id = dyn_ephemeral.common().id();
    let durable_request = SendableRequest::Get(dyn_durable.clone());

    let scheduler = reg.for_request(&durable_request).unwrap().clone();
    scheduler
        .register(vec![dyn_durable], Persistence::Durable, None, false)
        .unwrap();
    scheduler
        .register(vec![dyn_ephemeral], Persistence::Ephemeral, None, false)
        .unwrap();

    // wait for both store checks to finish
    iter_check!(1000, {
        if scheduler.count_queued_requests().total == 2 {
            break;
        }
    });
    assert!(reg.want_key(&key));

    // the more urgent durable get goes first, and only one fetch of the
    // key is ever in flight
    let chosen = scheduler.grab_request().unwrap();
    assert_eq!(Some(durable_id), chosen.request_id());
    assert_eq!(&key, chosen.key());
    assert!(scheduler.grab_request().is_none());

    chosen.on_fetch_failure(LowLevelGetError::DataNotFound);

    let mut wakeup: Option<Timestamp> = None;
    iter_check!(1000, {
        if !scheduler.has_fetching_key(&key) {
            wakeup = scheduler.wakeup_time(&durable_request, ItemToken(0));
            if wakeup.is_some() {
                break;
            }
        }
    });
    let wakeup = wakeup.unwrap();

    // while the durable item cools down, only the ephemeral one is eligible
    let cooling = Timestamp::from_micros(wakeup.as_micros() - 1);
    let during = scheduler.grab_request_at(cooling, false).unwrap();
    assert_eq!(Some(ephemeral_id), during.request_id());
    drop(during);

    tokio::time::sleep(
        wakeup.saturating_duration_since(Timestamp::now())
            + std::time::Duration::from_millis(5),
    )
    .await;

    let retried = scheduler.grab_request().unwrap();
    assert_eq!(Some(durable_id), retried.request_id());
    assert_eq!(&key, retried.key());
    assert!(durable.failures().is_empty());

    retried.on_fetch_success(KeyBlock::new(key.clone(), vec![42]));
    iter_check!(1000, {
        if durable.successes().len() == 1 && !scheduler.has_fetching_key(&key) {
            break;
        }
    });
    assert!(ephemeral.successes().is_empty());
    assert!(reg.want_key(&key));

    // the ephemeral get now fetches the key itself
    let last = scheduler.grab_request().unwrap();
    assert_eq!(Some(ephemeral_id), last.request_id());
    assert_eq!(&key, last.key());
    last.on_fetch_success(KeyBlock::new(key.clone(), vec![42]));

    iter_check!(1000, {
        if ephemeral.successes().len() == 1 && !scheduler.has_fetching_key(&key) {
            break;
        }
    });
    assert!(!reg.want_key(&key));
    assert!(scheduler.grab_request().is_none());
    let count = reg.count_queued_requests();
    assert_eq!(0, count.total);
    assert_eq!(0, count.listening);
    assert_eq!(0, count.fetching_keys);
}

#[tokio::test(flavor = "multi_thread")]
async fn trip_through_registry_reaches_both_traffic_classes() {
    let reg = registry().await;
    let keys = create_chk_list(1);

    let (bulk, dyn_bulk) = TestGet::new(
        test_common(Persistence::Ephemeral, PriorityClass::Update),
        keys.clone(),
    )
    .build();
    let (real_time, dyn_real_time) = TestGet::new(
        RequestCommon::new(
            Persistence::Ephemeral,
            TrafficClass::RealTime,
            KeyType::Chk,
            PriorityClass::Update,
        ),
        keys.clone(),
    )
    .build();

    for get in [dyn_bulk, dyn_real_time] {
        reg.for_request(&SendableRequest::Get(get.clone()))
            .unwrap()
            .register(vec![get], Persistence::Ephemeral, None, true)
            .unwrap();
    }

    assert_eq!(2, reg.trip_pending_key(KeyBlock::new(keys[0].clone(), vec![1])));
    iter_check!(1000, {
        if bulk.successes().len() == 1 && real_time.successes().len() == 1 {
            break;
        }
    });
}
