//! User domain shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use eventfold_kernel::{AnyEvent, EventType, Kind, ProjectionState, Registry, State};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub user_id: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub total_spending: u64,
    #[serde(skip)]
    pub password: Option<String>,
}

impl State for User {
    const KIND: &'static Kind = &Kind::owner("user");
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registered {
    pub user_id: String,
    pub name: String,
    pub email: String,
}

impl EventType for Registered {
    const KIND: &'static Kind = &Kind::event("user.registered");
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpentMoney {
    pub amount: u64,
}

impl EventType for SpentMoney {
    const KIND: &'static Kind = &Kind::event("user.spent_money");
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskedReceipt;

impl EventType for AskedReceipt {
    const KIND: &'static Kind = &Kind::event("user.asked_receipt");
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameChanged {
    pub name: String,
}

impl EventType for NameChanged {
    const KIND: &'static Kind = &Kind::event("user.name_changed");
}

/// Outdated shape of `NameChanged` that stored first and last names apart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameChangedV1 {
    pub first: String,
    pub last: String,
}

impl EventType for NameChangedV1 {
    const KIND: &'static Kind = &Kind::event("user.name_changed.v1").extends(NameChanged::KIND);

    fn upcast(self: Arc<Self>) -> Arc<dyn AnyEvent> {
        Arc::new(NameChanged {
            name: format!("{} {}", self.first, self.last),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MoneyOperations {
    pub total_spending: u64,
    pub receipts_asked: u64,
}

impl State for MoneyOperations {
    const KIND: &'static Kind = &Kind::owner("user.money_operations");
}

impl ProjectionState for MoneyOperations {
    type Owner = User;
    const EVENTS: &'static [&'static Kind] = &[SpentMoney::KIND, AskedReceipt::KIND];
}

pub fn registered(name: &str) -> Registered {
    Registered {
        user_id: "1".into(),
        name: name.into(),
        email: "some@example.com".into(),
    }
}

pub fn registry() -> Arc<Registry> {
    let mut builder = Registry::builder();
    builder
        .handle::<User, Registered>(|user, e| {
            user.user_id = Some(e.user_id.clone());
            user.name = Some(e.name.clone());
            user.email = Some(e.email.clone());
            user.password = Some("password".into());
        })
        .expect("register Registered")
        .handle::<User, SpentMoney>(|user, e| user.total_spending += e.amount)
        .expect("register SpentMoney")
        .handle::<User, AskedReceipt>(|_, _| {})
        .expect("register AskedReceipt")
        .intrinsic::<NameChanged>(&[User::KIND], |e, owner| {
            owner.with_view::<User, _>(|user| user.name = Some(e.name.clone()))?;
            Ok(())
        })
        .expect("register NameChanged")
        .event::<NameChangedV1>()
        .handle::<MoneyOperations, AskedReceipt>(|p, _| p.receipts_asked += 1)
        .expect("register projection AskedReceipt")
        .associate::<MoneyOperations>()
        .expect("associate MoneyOperations");
    Arc::new(builder.build())
}
