#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use opptick_core::config::OppTickConfig;
use opptick_core::intake::{IntakeEngine, IntakeReply};
use opptick_core::model::IntakeState;
use opptick_core::notify::InboundMessage;
use opptick_core::storage::SqliteStorage;
use uuid::Uuid;

pub const OWNER: &str = "alice";
pub const CHAT: &str = "chat-1";

/// Fixed reference instant for every test.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap()
}

pub fn memory_storage() -> Arc<SqliteStorage> {
    Arc::new(SqliteStorage::open_in_memory().expect("in-memory sqlite"))
}

pub fn config() -> OppTickConfig {
    OppTickConfig::default_config()
}

pub async fn say(
    engine: &IntakeEngine<SqliteStorage>,
    text: &str,
    at: DateTime<Utc>,
) -> IntakeReply {
    engine
        .handle(&InboundMessage::new(OWNER, CHAT, text, at))
        .await
        .expect("intake turn")
}

/// Drive a whole intake dialog: accept the proposed deadline and the
/// suggested category, pick `priority` (1-3) and a fixed title.
pub async fn capture(
    engine: &IntakeEngine<SqliteStorage>,
    text: &str,
    priority: u8,
    at: DateTime<Utc>,
) -> Uuid {
    let r = say(engine, text, at).await;
    assert_eq!(r.state, IntakeState::DeadlineProposed, "{}", r.text);
    say(engine, "yes", at).await;
    say(engine, "yes", at).await;
    say(engine, &priority.to_string(), at).await;
    let r = say(engine, "Test opportunity", at).await;
    assert_eq!(r.state, IntakeState::Saved, "{}", r.text);
    r.opportunity_id.expect("saved id")
}
