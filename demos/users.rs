//! Self-contained example: a user aggregate with a money projection,
//! persisted through the file-backed store and driven through an actor.
//!
//! Run with: `cargo run --example users`

use std::sync::Arc;

use eventfold_kernel::{
    Aggregate, AsyncEventStore, Event, EventType, FileStore, Kind, Pending, Projection,
    ProjectionState, Registry, SequenceOrder, State, open_aggregate,
};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// User aggregate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct User {
    name: Option<String>,
    email: Option<String>,
    total_spending: u64,
}

impl State for User {
    const KIND: &'static Kind = &Kind::owner("user");
}

#[derive(Debug, Serialize, Deserialize)]
struct Registered {
    name: String,
    email: String,
}

impl EventType for Registered {
    const KIND: &'static Kind = &Kind::event("user.registered");
}

#[derive(Debug, Serialize, Deserialize)]
struct SpentMoney {
    amount: u64,
}

impl EventType for SpentMoney {
    const KIND: &'static Kind = &Kind::event("user.spent_money");
}

#[derive(Debug, Serialize, Deserialize)]
struct AskedReceipt;

impl EventType for AskedReceipt {
    const KIND: &'static Kind = &Kind::event("user.asked_receipt");
}

// ---------------------------------------------------------------------------
// Money projection
// ---------------------------------------------------------------------------

/// Spending and receipts of one user, ignoring profile changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct MoneyOperations {
    total_spending: u64,
    receipts_asked: u64,
}

impl State for MoneyOperations {
    const KIND: &'static Kind = &Kind::owner("user.money_operations");
}

impl ProjectionState for MoneyOperations {
    type Owner = User;
    const EVENTS: &'static [&'static Kind] = &[SpentMoney::KIND, AskedReceipt::KIND];
}

fn registry() -> Result<Arc<Registry>, Box<dyn std::error::Error>> {
    let mut builder = Registry::builder();
    builder
        .handle::<User, Registered>(|user, e| {
            user.name = Some(e.name.clone());
            user.email = Some(e.email.clone());
        })?
        .handle::<User, SpentMoney>(|user, e| user.total_spending += e.amount)?
        .handle::<User, AskedReceipt>(|_, _| {})?
        .handle::<MoneyOperations, AskedReceipt>(|ops, _| ops.receipts_asked += 1)?
        .associate::<MoneyOperations>()?;
    Ok(Arc::new(builder.build()))
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let registry = registry()?;
    let tmp = tempfile::tempdir()?;
    let store = Arc::new(
        FileStore::builder(tmp.path())
            .auto_snapshot_each(2)
            .open(Arc::clone(&registry))?,
    );

    let mut user = Aggregate::<User>::with_id("john", Arc::clone(&registry))
        .with_auto_snapshot_each(2);
    user.apply(Event::new(Registered {
        name: "John Doe".into(),
        email: "john@example.com".into(),
    }))?
    .apply(Event::new(SpentMoney { amount: 10 }))?
    .apply(Event::new(SpentMoney { amount: 10 }))?;

    for entry in user.pending() {
        match entry {
            Pending::Event(event) => println!("pending event    {}", event.kind().name()),
            Pending::Snapshot(snapshot) => println!("pending snapshot {}", snapshot.kind),
        }
    }
    store.save(&mut user).await?;
    let checkpoint = SequenceOrder::now();

    // Drive further changes through an actor that owns the aggregate.
    let handle = open_aggregate::<User, _>(Arc::clone(&store), "john", None).await?;
    handle.apply(Event::new(SpentMoney { amount: 5 })).await?;
    handle.apply(Event::new(AskedReceipt)).await?;
    handle.save().await?;
    handle.shutdown().await?;

    let now: Aggregate<User> = store.load("john", None).await?;
    let then: Aggregate<User> = store.load("john", Some(checkpoint)).await?;
    println!(
        "{} spent {} (was {} at checkpoint)",
        now.state().name.as_deref().unwrap_or("?"),
        now.state().total_spending,
        then.state().total_spending
    );

    let money: Projection<MoneyOperations> = store.load_projection("john", None).await?;
    println!(
        "money operations: spent {}, receipts asked {}",
        money.state().total_spending,
        money.state().receipts_asked
    );

    assert_eq!(now.state().total_spending, 25);
    assert_eq!(then.state().total_spending, 20);
    assert_eq!(money.state().receipts_asked, 1);
    println!("all assertions passed");
    Ok(())
}
