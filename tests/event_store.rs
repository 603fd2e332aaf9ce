//! End-to-end scenarios against the blocking store contract.

mod common;

use std::thread::sleep;
use std::time::Duration;

use common::*;
use eventfold_kernel::{
    Aggregate, ApplyError, Event, EventStore, FileStore, InMemoryStore, Pending, Projection,
    SequenceOrder,
};
use tempfile::TempDir;

fn kinds(pending: &[Pending]) -> Vec<&'static str> {
    pending
        .iter()
        .map(|p| match p {
            Pending::Event(e) => e.kind().name(),
            Pending::Snapshot(_) => "snapshot",
        })
        .collect()
}

#[test]
fn registered_user_round_trips_through_store() {
    let store = InMemoryStore::new(registry());
    let mut user = Aggregate::<User>::new(registry());
    user.apply(Event::new(registered("John Doe"))).unwrap();
    store.save(&mut user).unwrap();

    let loaded: Aggregate<User> = store.load(user.id(), None).unwrap();
    assert_eq!(loaded.state().name.as_deref(), Some("John Doe"));
    assert_eq!(loaded.state().user_id.as_deref(), Some("1"));
    assert_eq!(loaded.state().email.as_deref(), Some("some@example.com"));
    assert_eq!(loaded.state().password.as_deref(), Some("password"));
}

#[test]
fn point_in_time_load_excludes_later_events() {
    let store = InMemoryStore::new(registry());
    let mut user = Aggregate::<User>::new(registry());
    user.apply(Event::new(registered("John Doe"))).unwrap();
    store.save(&mut user).unwrap();

    let checkpoint = SequenceOrder::now();
    sleep(Duration::from_millis(5));

    user.apply(Event::new(SpentMoney { amount: 10 }))
        .unwrap()
        .apply(Event::new(AskedReceipt))
        .unwrap();
    store.save(&mut user).unwrap();

    let past: Aggregate<User> = store.load(user.id(), Some(checkpoint)).unwrap();
    assert_eq!(past.state().total_spending, 0);
    assert_eq!(past.state().name.as_deref(), Some("John Doe"));

    let present: Aggregate<User> = store.load(user.id(), None).unwrap();
    assert_eq!(present.state().total_spending, 10);
}

#[test]
fn projection_replays_whitelisted_events_only() {
    let store = InMemoryStore::new(registry());
    let mut user = Aggregate::<User>::new(registry());
    user.apply(Event::new(registered("John Doe")))
        .unwrap()
        .apply(Event::new(SpentMoney { amount: 10 }))
        .unwrap()
        .apply(Event::new(AskedReceipt))
        .unwrap();
    store.save(&mut user).unwrap();

    let projection: Projection<MoneyOperations> =
        store.load_projection(user.id(), None).unwrap();
    assert_eq!(projection.state().total_spending, 10);
    assert_eq!(projection.state().receipts_asked, 1);
}

#[test]
fn projection_rejects_owner_event_outside_whitelist() {
    let mut projection = Projection::<MoneyOperations>::new(registry());
    let err = projection
        .apply(Event::new(NameChanged {
            name: "Other".into(),
        }))
        .unwrap_err();
    assert!(matches!(err, ApplyError::HandlerNotFound { .. }));
}

#[test]
fn auto_snapshot_scenario() {
    let store = InMemoryStore::new(registry());
    let mut user = Aggregate::<User>::new(registry()).with_auto_snapshot_each(2);
    user.apply(Event::new(registered("John")))
        .unwrap()
        .apply(Event::new(SpentMoney { amount: 10 }))
        .unwrap()
        .apply(Event::new(SpentMoney { amount: 10 }))
        .unwrap();

    assert_eq!(
        kinds(user.pending()),
        vec![
            "user.registered",
            "user.spent_money",
            "snapshot",
            "user.spent_money"
        ]
    );
    assert_eq!(user.pending().len(), 4);
    assert_eq!(user.events_applied(), 3);

    store.save(&mut user).unwrap();
    assert_eq!(store.snapshots(user.id(), "user").len(), 1);
    assert_eq!(store.event_count(user.id()), 3);

    let loaded: Aggregate<User> = store.load(user.id(), None).unwrap();
    assert_eq!(loaded.state().total_spending, 20);
    assert_eq!(loaded.state().name.as_deref(), Some("John"));
    // Private attributes are not captured by snapshots.
    assert_eq!(loaded.state().password, None);
    assert!(loaded.pending().is_empty());
}

#[test]
fn snapshot_round_trip_law() {
    let registry = registry();
    let mut user = Aggregate::<User>::new(registry.clone());
    user.apply(Event::new(registered("John")))
        .unwrap()
        .apply(Event::new(SpentMoney { amount: 7 }))
        .unwrap()
        .apply(Event::new(NameChanged {
            name: "Johnny".into(),
        }))
        .unwrap();

    let snapshot = user.create_snapshot().unwrap();
    let restored = Aggregate::<User>::from_snapshot(user.id(), &snapshot, registry).unwrap();

    let mut expected = user.state().clone();
    expected.password = None;
    assert_eq!(restored.state(), &expected);
}

#[test]
fn outdated_events_are_upcast_on_replay() {
    let store = InMemoryStore::new(registry());
    let mut user = Aggregate::<User>::new(registry());
    user.apply(Event::new(registered("John")))
        .unwrap()
        .apply(Event::new(NameChangedV1 {
            first: "Ada".into(),
            last: "Lovelace".into(),
        }))
        .unwrap();
    assert_eq!(user.state().name.as_deref(), Some("Ada Lovelace"));
    store.save(&mut user).unwrap();

    let loaded: Aggregate<User> = store.load(user.id(), None).unwrap();
    assert_eq!(loaded.state().name.as_deref(), Some("Ada Lovelace"));
}

#[test]
fn file_store_survives_reopen_with_upcasting() {
    let tmp = TempDir::new().expect("failed to create temp dir");
    let id = {
        let store = FileStore::builder(tmp.path())
            .auto_snapshot_each(2)
            .open(registry())
            .expect("open store");
        let mut user = Aggregate::<User>::new(registry()).with_auto_snapshot_each(2);
        user.apply(Event::new(registered("John")))
            .unwrap()
            .apply(Event::new(SpentMoney { amount: 10 }))
            .unwrap()
            .apply(Event::new(NameChangedV1 {
                first: "Ada".into(),
                last: "Lovelace".into(),
            }))
            .unwrap();
        store.save(&mut user).unwrap();
        user.id().to_owned()
    };

    let store = FileStore::builder(tmp.path())
        .auto_snapshot_each(2)
        .open(registry())
        .expect("reopen store");
    let user: Aggregate<User> = store.load(&id, None).unwrap();
    assert_eq!(user.state().name.as_deref(), Some("Ada Lovelace"));
    assert_eq!(user.state().total_spending, 10);
    assert_eq!(user.auto_snapshot_each().map(|n| n.get()), Some(2));
    assert_eq!(store.list_streams().unwrap(), vec![id]);
}

#[test]
fn saving_a_projection_leaves_owner_stream_alone() {
    let store = InMemoryStore::new(registry());
    let mut user = Aggregate::<User>::new(registry());
    user.apply(Event::new(SpentMoney { amount: 10 })).unwrap();
    store.save(&mut user).unwrap();

    let mut money: Projection<MoneyOperations> =
        store.load_projection(user.id(), None).unwrap();
    money
        .apply(Event::new(SpentMoney { amount: 5 }))
        .unwrap()
        .record_snapshot()
        .unwrap();
    store.save(&mut money).unwrap();
    assert!(money.pending().is_empty());

    assert_eq!(store.event_count(user.id()), 1);
    let owner: Aggregate<User> = store.load(user.id(), None).unwrap();
    assert_eq!(owner.state().total_spending, 10);

    let snapshots = store.snapshots(user.id(), "user.money_operations");
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].data["total_spending"], 15);
}

#[test]
fn point_in_time_load_ignores_later_snapshots() {
    let tmp = TempDir::new().expect("failed to create temp dir");
    let store = FileStore::builder(tmp.path())
        .open(registry())
        .expect("open store");

    let mut user = Aggregate::<User>::with_id("user-1", registry());
    user.apply(Event::new(SpentMoney { amount: 1 })).unwrap();
    store.save(&mut user).unwrap();
    let checkpoint = SequenceOrder::now();

    user.apply(Event::new(SpentMoney { amount: 2 }))
        .unwrap()
        .record_snapshot()
        .unwrap()
        .apply(Event::new(SpentMoney { amount: 4 }))
        .unwrap();
    store.save(&mut user).unwrap();

    let past: Aggregate<User> = store.load("user-1", Some(checkpoint)).unwrap();
    assert_eq!(past.state().total_spending, 1);

    let present: Aggregate<User> = store.load("user-1", None).unwrap();
    assert_eq!(present.state().total_spending, 7);
}
