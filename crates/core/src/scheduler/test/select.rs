use super::utils::*;
use crate::scheduler::*;
use blockswarm_api::*;
use blockswarm_test_utils::{
    id::{create_chk_list, random_node_key},
    iter_check,
    request::*,
};
use std::collections::HashSet;
use std::sync::Arc;

fn get(
    persistence: Persistence,
    priority: PriorityClass,
    keys: Vec<NodeKey>,
) -> (Arc<TestGet>, DynSendableGet) {
    TestGet::new(test_common(persistence, priority), keys).build()
}

#[tokio::test(flavor = "multi_thread")]
async fn nothing_registered_nothing_chosen() {
    let s = scheduler(chk_fetch());
    assert!(s.grab_request().is_none());
    assert!(s.next_wakeup().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn urgent_classes_are_served_first() {
    let s = scheduler(chk_fetch());
    let (_, lazy) = get(Persistence::Ephemeral, PriorityClass::Minimum, create_chk_list(1));
    let (_, urgent) = get(Persistence::Ephemeral, PriorityClass::Maximum, create_chk_list(1));
    let urgent_id = urgent.common().id();
    s.register(vec![lazy, urgent], Persistence::Ephemeral, None, true)
        .unwrap();

    let chosen = s.grab_request().unwrap();
    assert_eq!(Some(urgent_id), chosen.request_id());
    assert_eq!(Persistence::Ephemeral, chosen.persistence());
    assert!(!chosen.flags().real_time);
}

#[tokio::test(flavor = "multi_thread")]
async fn a_key_is_fetched_once_until_released() {
    let s = scheduler(chk_fetch());
    let keys = create_chk_list(1);
    let (_, a) = get(Persistence::Ephemeral, PriorityClass::Update, keys.clone());
    let (_, b) = get(Persistence::Durable, PriorityClass::Update, keys.clone());
    s.register(vec![a], Persistence::Ephemeral, None, true).unwrap();
    s.register(vec![b], Persistence::Durable, None, true).unwrap();

    let chosen = s.grab_request().unwrap();
    assert_eq!(&keys[0], chosen.key());
    assert!(s.has_fetching_key(&keys[0]));
    assert!(s.grab_request().is_none());

    // dropping without a completion releases the key
    drop(chosen);
    assert!(!s.has_fetching_key(&keys[0]));
    assert!(s.grab_request().is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_grabs_never_share_a_key() {
    let s = scheduler(chk_fetch());
    let keys = create_chk_list(20);
    let mut getters = Vec::new();
    for _ in 0..3 {
        let (_, g) = get(Persistence::Ephemeral, PriorityClass::Update, keys.clone());
        getters.push(g);
    }
    s.register(getters, Persistence::Ephemeral, None, true).unwrap();

    let chosen: Vec<ChosenBlock> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = s.clone();
                scope.spawn(move || {
                    let mut out = Vec::new();
                    while let Some(c) = s.grab_request_at(Timestamp::now(), false) {
                        out.push(c);
                    }
                    out
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });

    let unique: HashSet<NodeKey> = chosen.iter().map(|c| c.key().clone()).collect();
    assert_eq!(20, chosen.len());
    assert_eq!(20, unique.len());
    assert_eq!(20, s.count_queued_requests().fetching_keys);
}

#[tokio::test(flavor = "multi_thread")]
async fn insert_items_are_sent_once() {
    let s = scheduler(chk_insert());
    let keys = create_chk_list(1);
    let (insert, dyn_insert) = TestInsert::new(
        test_common(Persistence::Ephemeral, PriorityClass::Update),
        keys.clone(),
    )
    .build();
    s.register_insert(dyn_insert).unwrap();

    let chosen = s.grab_request().unwrap();
    assert!(chosen.is_insert());
    assert_eq!(Some(ItemToken(0)), chosen.token());
    assert!(s.grab_request().is_none());
    assert_eq!(1, s.count_queued_requests().running_inserts);

    chosen.on_insert_success(keys[0].clone());
    iter_check!(1000, {
        if s.count_queued_requests().running_inserts == 0 {
            break;
        }
    });
    assert_eq!(
        vec![InsertOutcome::Success(ItemToken(0), keys[0].clone())],
        insert.outcomes()
    );

    // the exhausted insert is dropped on the next pass
    assert!(s.grab_request().is_none());
    assert_eq!(0, s.count_queued_requests().total);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_request_gets_a_cancel_per_item() {
    let s = scheduler(chk_fetch());
    let (g, dyn_g) = get(Persistence::Ephemeral, PriorityClass::Update, create_chk_list(2));
    s.register(vec![dyn_g.clone()], Persistence::Ephemeral, None, true)
        .unwrap();

    let in_flight = s.grab_request().unwrap();
    dyn_g.common().cancel();
    assert!(s.grab_request().is_none());

    // the in-flight item is reported when its fetch completes
    let block = KeyBlock::new(in_flight.key().clone(), vec![3]);
    in_flight.on_fetch_success(block);

    iter_check!(1000, {
        if g.failures().len() == 2 {
            break;
        }
    });
    assert!(g.successes().is_empty());
    for (_, err) in g.failures() {
        assert_eq!(FetchErrorMode::Cancelled, err.mode);
    }
    assert_eq!(0, s.count_queued_requests().total);
    assert_eq!(0, s.count_queued_requests().listening);
}

#[tokio::test(flavor = "multi_thread")]
async fn priority_change_takes_effect_on_reregister() {
    let s = scheduler(chk_fetch());
    let (_, a) = get(Persistence::Ephemeral, PriorityClass::Minimum, create_chk_list(1));
    let (_, b) = get(Persistence::Ephemeral, PriorityClass::Update, create_chk_list(1));
    s.register(vec![a.clone(), b], Persistence::Ephemeral, None, true)
        .unwrap();

    let request = SendableRequest::Get(a.clone());
    let old = a.common().set_priority(PriorityClass::Maximum);
    assert!(s.reregister_all(&request, old));
    assert_eq!(
        1,
        s.count_queued_requests().by_priority[PriorityClass::Maximum.index()]
    );

    let chosen = s.grab_request().unwrap();
    assert_eq!(Some(a.common().id()), chosen.request_id());
}

#[tokio::test(flavor = "multi_thread")]
async fn offered_keys_are_served_for_listeners() {
    let s = scheduler(chk_fetch());
    let keys = create_chk_list(2);
    let (g, dyn_g) = get(Persistence::Durable, PriorityClass::Prefetch, vec![keys[0].clone()]);
    s.register(vec![dyn_g], Persistence::Durable, None, true).unwrap();

    assert!(s.queue_offered_key(keys[1].clone()));
    assert!(s.queue_offered_key(keys[0].clone()));
    assert!(!s.queue_offered_key(keys[0].clone()));
    assert_eq!(2, s.count_queued_requests().offered_keys);

    let chosen = s.grab_request().unwrap();
    assert!(chosen.is_offer());
    assert_eq!(&keys[0], chosen.key());
    assert_eq!(None, chosen.token());

    let block = KeyBlock::new(keys[0].clone(), vec![4]);
    chosen.on_fetch_success(block);
    iter_check!(1000, {
        if g.successes() == vec![ItemToken(0)] {
            break;
        }
    });

    // nobody wants keys[1]
    iter_check!(1000, {
        if !s.has_fetching_key(&keys[0]) {
            break;
        }
    });
    assert!(s.grab_request().is_none());
    assert_eq!(1, s.count_queued_requests().offered_keys);
}

#[tokio::test(flavor = "multi_thread")]
async fn offered_keys_must_match_the_scheduler() {
    let fetch = scheduler(chk_fetch());
    let insert = scheduler(chk_insert());
    assert!(!insert.queue_offered_key(create_chk_list(1).remove(0)));
    assert!(!fetch.queue_offered_key(random_node_key(KeyType::Ssk)));
    assert_eq!(0, fetch.count_queued_requests().offered_keys);
}

#[tokio::test(flavor = "multi_thread")]
async fn waiters_are_woken_when_a_shared_key_is_released() {
    let s = scheduler(chk_fetch());
    let keys = create_chk_list(1);
    let (_, a) = get(Persistence::Ephemeral, PriorityClass::Maximum, keys.clone());
    let (_, b) = get(Persistence::Ephemeral, PriorityClass::Update, keys.clone());
    let b_id = b.common().id();
    s.register(vec![a, b.clone()], Persistence::Ephemeral, None, true)
        .unwrap();

    let chosen = s.grab_request().unwrap();
    assert!(s.has_fetching_key_for(&keys[0], Some(b_id), Persistence::Ephemeral));
    assert!(s.has_fetching_key_for(&keys[0], None, Persistence::Durable));

    let request = SendableRequest::Get(b);
    s.handle_failure(
        &request,
        ItemToken(0),
        FetchError::new(FetchErrorMode::RouteNotFound, "busy").into(),
    );
    assert!(s.next_wakeup().is_some());

    drop(chosen);
    assert!(s.next_wakeup().is_none());
}
