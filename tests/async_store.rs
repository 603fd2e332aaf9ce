//! The async store contract and the aggregate actor, over both backends.

mod common;

use std::sync::Arc;

use common::*;
use eventfold_kernel::{
    Aggregate, AggregateHandle, AsyncEventStore, Event, EventType, FileStore, HandleError,
    InMemoryStore, Kind, Projection, open_aggregate, spawn_aggregate,
};
use tempfile::TempDir;

fn file_store(dir: &TempDir) -> Arc<FileStore> {
    Arc::new(
        FileStore::builder(dir.path())
            .open(registry())
            .expect("open store"),
    )
}

#[tokio::test]
async fn file_store_async_round_trip() {
    let tmp = TempDir::new().expect("failed to create temp dir");
    let store = file_store(&tmp);

    let mut user = Aggregate::<User>::with_id("user-1", registry());
    user.apply(Event::new(registered("John")))
        .unwrap()
        .apply(Event::new(SpentMoney { amount: 15 }))
        .unwrap()
        .record_snapshot()
        .unwrap()
        .apply(Event::new(AskedReceipt))
        .unwrap();
    store.save(&mut user).await.unwrap();
    assert!(user.pending().is_empty());

    let loaded: Aggregate<User> = store.load("user-1", None).await.unwrap();
    assert_eq!(loaded.state().total_spending, 15);
    assert_eq!(loaded.state().name.as_deref(), Some("John"));

    let money: Projection<MoneyOperations> =
        store.load_projection("user-1", None).await.unwrap();
    assert_eq!(money.state().total_spending, 15);
    assert_eq!(money.state().receipts_asked, 1);
}

#[tokio::test]
async fn projection_snapshot_is_stored_beside_owner() {
    let store = Arc::new(InMemoryStore::new(registry()));

    let mut user = Aggregate::<User>::with_id("user-1", registry());
    user.apply(Event::new(registered("John")))
        .unwrap()
        .apply(Event::new(SpentMoney { amount: 5 }))
        .unwrap();
    store.save(&mut user).await.unwrap();

    let mut money: Projection<MoneyOperations> =
        store.load_projection("user-1", None).await.unwrap();
    money.record_snapshot().unwrap();
    store.save(&mut money).await.unwrap();

    assert_eq!(store.snapshots("user-1", "user.money_operations").len(), 1);
    assert!(store.snapshots("user-1", "user").is_empty());

    user.apply(Event::new(SpentMoney { amount: 5 })).unwrap();
    store.save(&mut user).await.unwrap();

    let money: Projection<MoneyOperations> =
        store.load_projection("user-1", None).await.unwrap();
    assert_eq!(money.state().total_spending, 10);
}

#[tokio::test]
async fn handle_applies_and_saves_through_file_store() {
    let tmp = TempDir::new().expect("failed to create temp dir");
    let store = file_store(&tmp);

    let handle: AggregateHandle<User, FileStore> =
        open_aggregate(Arc::clone(&store), "user-7", None)
            .await
            .unwrap();
    handle.apply(Event::new(registered("Ada"))).await.unwrap();
    handle
        .apply(Event::new(NameChangedV1 {
            first: "Ada".into(),
            last: "Lovelace".into(),
        }))
        .await
        .unwrap();
    handle.save().await.unwrap();
    assert_eq!(handle.pending_len().await.unwrap(), 0);
    handle.shutdown().await.unwrap();

    let reopened = file_store(&tmp);
    let user: Aggregate<User> = reopened.load("user-7", None).await.unwrap();
    assert_eq!(user.state().name.as_deref(), Some("Ada Lovelace"));
}

#[tokio::test]
async fn handle_rejects_unhandled_event_and_keeps_state() {
    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    struct Deleted;

    impl EventType for Deleted {
        const KIND: &'static Kind = &Kind::event("user.deleted");
    }

    let store = Arc::new(InMemoryStore::new(registry()));
    let handle = spawn_aggregate(Aggregate::<User>::new(registry()), store);
    handle.apply(Event::new(SpentMoney { amount: 3 })).await.unwrap();

    let err = handle.apply(Event::new(Deleted)).await.unwrap_err();
    assert!(matches!(err, HandleError::Apply(_)));
    assert_eq!(handle.pending_len().await.unwrap(), 1);
    assert_eq!(handle.state().await.unwrap().total_spending, 3);
}

#[tokio::test]
async fn handle_reports_gone_after_shutdown() {
    let store = Arc::new(InMemoryStore::new(registry()));
    let handle = spawn_aggregate(Aggregate::<User>::new(registry()), store);
    let other = handle.clone();

    handle.shutdown().await.unwrap();
    let err = other.state().await.unwrap_err();
    assert!(matches!(err, HandleError::ActorGone));
    assert!(!other.is_alive());
}

#[tokio::test]
async fn concurrent_handles_on_different_ids() {
    let tmp = TempDir::new().expect("failed to create temp dir");
    let store = file_store(&tmp);

    let mut tasks = Vec::new();
    for i in 0..4u64 {
        let store = Arc::clone(&store);
        tasks.push(tokio::spawn(async move {
            let id = format!("user-{i}");
            let handle: AggregateHandle<User, FileStore> =
                open_aggregate(store, &id, None).await.unwrap();
            handle.apply(Event::new(registered("John"))).await.unwrap();
            handle
                .apply(Event::new(SpentMoney { amount: i }))
                .await
                .unwrap();
            handle.save().await.unwrap();
            id
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let mut streams = store.list_streams().unwrap();
    streams.sort();
    assert_eq!(streams, vec!["user-0", "user-1", "user-2", "user-3"]);
    let user: Aggregate<User> = store.load("user-3", None).await.unwrap();
    assert_eq!(user.state().total_spending, 3);
}
