//! Reminder timetable computation and persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::ReminderConfig;
use crate::error::Result;
use crate::model::*;
use crate::storage::StorageBackend;

/// One entry of a computed timetable, before it gets an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedReminder {
    pub kind: ReminderKind,
    pub fire_at: DateTime<Utc>,
}

/// When a reminder of `kind` fires for `deadline`.
///
/// The day-of reminder is pinned to `day_of_hour` on the deadline date but
/// never later than the deadline itself.
pub fn fire_time(kind: ReminderKind, deadline: DateTime<Utc>, day_of_hour: u32) -> DateTime<Utc> {
    match kind.offset() {
        Some(offset) => deadline - offset,
        None => deadline
            .date_naive()
            .and_hms_opt(day_of_hour.min(23), 0, 0)
            .map(|dt| dt.and_utc())
            .map_or(deadline, |pinned| pinned.min(deadline)),
    }
}

/// Timetable for `opportunity` as seen at `now`: the priority tier minus
/// entries already in the past. Non-active opportunities get nothing.
pub fn plan(opportunity: &Opportunity, now: DateTime<Utc>, day_of_hour: u32) -> Vec<PlannedReminder> {
    if !opportunity.is_active() {
        return Vec::new();
    }
    ReminderKind::tier(opportunity.priority)
        .iter()
        .map(|&kind| PlannedReminder {
            kind,
            fire_at: fire_time(kind, opportunity.deadline, day_of_hour),
        })
        .filter(|p| p.fire_at > now)
        .collect()
}

/// Computes timetables and writes them through the store. Every write is a
/// single transaction, so the dispatch worker sees either the old set or the
/// new one.
pub struct ReminderScheduler<S> {
    storage: Arc<S>,
    day_of_hour: u32,
}

impl<S> Clone for ReminderScheduler<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            day_of_hour: self.day_of_hour,
        }
    }
}

impl<S: StorageBackend> ReminderScheduler<S> {
    pub fn new(storage: Arc<S>, config: &ReminderConfig) -> Self {
        Self {
            storage,
            day_of_hour: config.day_of_hour,
        }
    }

    pub fn plan(&self, opportunity: &Opportunity, now: DateTime<Utc>) -> Vec<PlannedReminder> {
        plan(opportunity, now, self.day_of_hour)
    }

    /// The plan as reminder rows ready to insert.
    pub fn build(&self, opportunity: &Opportunity, now: DateTime<Utc>) -> Vec<Reminder> {
        self.plan(opportunity, now)
            .into_iter()
            .map(|p| Reminder::new(opportunity, p.kind, p.fire_at))
            .collect()
    }

    /// Make the pending set equal the plan. Rows already matching keep their
    /// ids, so calling this twice changes nothing.
    pub async fn schedule(&self, opportunity: &Opportunity, now: DateTime<Utc>) -> Result<Vec<Reminder>> {
        let planned = self.build(opportunity, now);
        let pending = self
            .storage
            .replace_pending_reminders(opportunity.id, &planned, ReplaceMode::KeepMatching)
            .await?;
        tracing::debug!(
            opportunity = %opportunity.id,
            pending = pending.len(),
            "scheduled reminders"
        );
        Ok(pending)
    }

    /// Cancel every pending reminder and insert a fresh plan.
    pub async fn reschedule(&self, opportunity: &Opportunity, now: DateTime<Utc>) -> Result<Vec<Reminder>> {
        let planned = self.build(opportunity, now);
        let pending = self
            .storage
            .replace_pending_reminders(opportunity.id, &planned, ReplaceMode::CancelAll)
            .await?;
        tracing::info!(
            opportunity = %opportunity.id,
            deadline = %opportunity.deadline,
            pending = pending.len(),
            "rescheduled reminders"
        );
        Ok(pending)
    }

    /// Mark every pending reminder of the opportunity cancelled.
    pub async fn cancel(&self, opportunity_id: Uuid) -> Result<usize> {
        let n = self.storage.cancel_pending_reminders(opportunity_id).await?;
        tracing::debug!(opportunity = %opportunity_id, cancelled = n, "cancelled reminders");
        Ok(n)
    }
}
