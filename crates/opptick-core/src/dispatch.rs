//! Reminder delivery.
//!
//! Each tick reads every pending reminder that is due, decides what to do
//! with it ([`plan_tick`], pure), then delivers item by item under the
//! opportunity's lock. Delivery happens before the `sent` flag is written,
//! so a crash in between produces one duplicate rather than a lost
//! reminder. The persisted rows are the whole schedule: a restarted worker
//! simply picks up everything still pending.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ReminderConfig;
use crate::error::{OppTickError, Result};
use crate::locks::KeyedLocks;
use crate::model::*;
use crate::notify::{send_within, Action, Notifier, OutboundMessage};
use crate::storage::StorageBackend;
use crate::summary::{format_countdown, format_deadline};

/// Due reminders read per tick.
const BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickAction {
    Deliver,
    /// The opportunity is done or archived: mark sent without notifying.
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedItem {
    pub reminder_id: Uuid,
    pub opportunity_id: Uuid,
    pub action: TickAction,
}

/// Decide what each due row gets. Rows that are not due at `now` are
/// ignored. Every due reminder of an active opportunity is delivered, so a
/// backlog left by downtime comes out in fire order.
pub fn plan_tick(now: DateTime<Utc>, rows: &[DueReminder]) -> Vec<PlannedItem> {
    rows.iter()
        .filter(|r| r.reminder.is_due(now))
        .map(|row| PlannedItem {
            reminder_id: row.reminder.id,
            opportunity_id: row.opportunity.id,
            action: if row.opportunity.is_active() {
                TickAction::Deliver
            } else {
                TickAction::Skip
            },
        })
        .collect()
}

/// Outcome counts of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub delivered: usize,
    pub skipped: usize,
    /// Gave up after the last allowed attempt.
    pub failed: usize,
    /// Failed this time, will be retried next tick.
    pub retrying: usize,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.delivered + self.skipped + self.failed + self.retrying == 0
    }
}

/// Text and actions of a reminder notification.
pub fn render_reminder(reminder: &Reminder, opp: &Opportunity, now: DateTime<Utc>) -> OutboundMessage {
    let text = if opp.deadline < now {
        format!(
            "DEADLINE PASSED: {} ({})\nDeadline was: {}",
            opp.title,
            opp.category,
            format_deadline(opp.deadline)
        )
    } else if reminder.kind == ReminderKind::DayOf {
        format!(
            "DEADLINE TODAY!\n\n{} ({})\nDeadline: {}\nTime left: {}",
            opp.title,
            opp.category,
            format_deadline(opp.deadline),
            format_countdown(opp.deadline, now)
        )
    } else {
        format!(
            "Reminder ({}): {} ({})\nDeadline: {}\nTime left: {}",
            reminder.kind.describe(),
            opp.title,
            opp.category,
            format_deadline(opp.deadline),
            format_countdown(opp.deadline, now)
        )
    };
    OutboundMessage {
        owner_id: opp.owner_id.clone(),
        conversation_id: opp.conversation_id.clone(),
        text,
        actions: vec![Action::done(opp.id)],
    }
}

enum ItemOutcome {
    Delivered,
    Skipped,
    Retrying,
    Failed,
    /// Already handled elsewhere, or no longer due.
    Stale,
}

pub struct DispatchWorker<S, N> {
    storage: Arc<S>,
    notifier: Arc<N>,
    locks: Arc<KeyedLocks<Uuid>>,
    tick_interval: StdDuration,
    delivery_timeout: StdDuration,
    max_attempts: u32,
}

impl<S: StorageBackend, N: Notifier> DispatchWorker<S, N> {
    pub fn new(
        storage: Arc<S>,
        notifier: Arc<N>,
        locks: Arc<KeyedLocks<Uuid>>,
        config: &ReminderConfig,
    ) -> Self {
        Self {
            storage,
            notifier,
            locks,
            tick_interval: StdDuration::from_secs(config.tick_secs.max(1)),
            delivery_timeout: config.delivery_timeout(),
            max_attempts: config.max_attempts.max(1),
        }
    }

    /// Process everything due at `now`. A failed scan aborts the tick with
    /// nothing changed; per-item failures are counted and retried later.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let rows = self.storage.due_reminders(now, BATCH_SIZE).await?;
        let plan = plan_tick(now, &rows);
        let mut report = TickReport::default();

        for item in plan {
            match self.process(item, now).await {
                Ok(ItemOutcome::Delivered) => report.delivered += 1,
                Ok(ItemOutcome::Skipped) => report.skipped += 1,
                Ok(ItemOutcome::Retrying) => report.retrying += 1,
                Ok(ItemOutcome::Failed) => report.failed += 1,
                Ok(ItemOutcome::Stale) => {}
                Err(e) if e.is_transient() => {
                    tracing::warn!(reminder = %item.reminder_id, error = %e, "reminder left for next tick");
                }
                Err(e) => {
                    tracing::error!(reminder = %item.reminder_id, error = %e, "reminder could not be processed");
                }
            }
        }

        if !report.is_empty() {
            tracing::info!(
                delivered = report.delivered,
                skipped = report.skipped,
                retrying = report.retrying,
                failed = report.failed,
                "dispatch tick"
            );
        }
        Ok(report)
    }

    async fn process(&self, item: PlannedItem, now: DateTime<Utc>) -> Result<ItemOutcome> {
        let _guard = self.locks.lock(item.opportunity_id).await;

        // The row may have been cancelled or rescheduled since the scan.
        let reminder = match self.storage.get_reminder(item.reminder_id).await {
            Ok(r) => r,
            Err(OppTickError::NotFound(_)) => return Ok(ItemOutcome::Stale),
            Err(e) => return Err(e),
        };
        if !reminder.is_due(now) {
            return Ok(ItemOutcome::Stale);
        }
        let opp = match self.storage.get_opportunity(item.opportunity_id).await {
            Ok(o) => o,
            Err(OppTickError::NotFound(_)) => return Ok(ItemOutcome::Stale),
            Err(e) => return Err(e),
        };

        let action = if opp.is_active() {
            item.action
        } else {
            TickAction::Skip
        };

        match action {
            TickAction::Skip => {
                self.storage.mark_reminder_sent(reminder.id).await?;
                tracing::debug!(reminder = %reminder.id, status = %opp.status, "reminder skipped");
                Ok(ItemOutcome::Skipped)
            }
            TickAction::Deliver => {
                let message = render_reminder(&reminder, &opp, now);
                let sent = send_within(self.notifier.as_ref(), &message, self.delivery_timeout).await;

                match sent {
                    Ok(()) => {
                        self.storage.mark_reminder_sent(reminder.id).await?;
                        tracing::debug!(
                            reminder = %reminder.id,
                            kind = %reminder.kind,
                            opportunity = %opp.id,
                            "reminder delivered"
                        );
                        Ok(ItemOutcome::Delivered)
                    }
                    Err(e) => {
                        // A permanent refusal will not get better on retry.
                        let limit = if e.is_transient() { self.max_attempts } else { 1 };
                        let updated = self
                            .storage
                            .record_reminder_failure(reminder.id, &e.to_string(), limit)
                            .await?;
                        if updated.failed {
                            tracing::error!(
                                reminder = %reminder.id,
                                opportunity = %opp.id,
                                attempts = updated.attempts,
                                error = %e,
                                "reminder delivery failed permanently"
                            );
                            Ok(ItemOutcome::Failed)
                        } else {
                            tracing::warn!(
                                reminder = %reminder.id,
                                attempts = updated.attempts,
                                error = %e,
                                "reminder delivery failed, will retry"
                            );
                            Ok(ItemOutcome::Retrying)
                        }
                    }
                }
            }
        }
    }

    /// Tick until `shutdown` is cancelled. The first tick runs immediately,
    /// which is what delivers reminders that fell due while stopped.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.tick(Utc::now()).await {
                tracing::warn!(error = %e, "dispatch tick skipped");
            }
        }
        tracing::debug!("dispatch worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::MemoryNotifier;
    use crate::storage::SqliteStorage;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
    }

    fn row(opp: &Opportunity, kind: ReminderKind, fire_at: DateTime<Utc>) -> DueReminder {
        DueReminder {
            reminder: Reminder::new(opp, kind, fire_at),
            opportunity: opp.clone(),
        }
    }

    fn opportunity(deadline: DateTime<Utc>) -> Opportunity {
        Opportunity::new("alice".into(), "chat".into(), "Acme".into(), deadline)
    }

    #[test]
    fn plan_tick_delivers_active_and_skips_inactive() {
        let active = opportunity(now() + Duration::days(3));
        let mut done = opportunity(now() + Duration::days(3));
        done.status = OpportunityStatus::Done;

        let rows = vec![
            row(&active, ReminderKind::ThreeDays, now()),
            row(&done, ReminderKind::ThreeDays, now()),
        ];
        let plan = plan_tick(now(), &rows);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].action, TickAction::Deliver);
        assert_eq!(plan[1].action, TickAction::Skip);
    }

    #[test]
    fn plan_tick_ignores_rows_not_due() {
        let opp = opportunity(now() + Duration::days(3));
        let mut sent = row(&opp, ReminderKind::ThreeDays, now());
        sent.reminder.sent = true;
        let rows = vec![row(&opp, ReminderKind::OneDay, now() + Duration::minutes(1)), sent];
        assert!(plan_tick(now(), &rows).is_empty());
    }

    #[test]
    fn plan_tick_delivers_whole_backlog() {
        let opp = opportunity(now() + Duration::days(1));
        let rows = vec![
            row(&opp, ReminderKind::SevenDays, now() - Duration::days(6)),
            row(&opp, ReminderKind::ThreeDays, now() - Duration::days(2)),
            row(&opp, ReminderKind::OneDay, now()),
        ];
        let plan = plan_tick(now(), &rows);
        assert_eq!(plan.len(), 3);
        assert!(plan.iter().all(|p| p.action == TickAction::Deliver));
    }

    #[test]
    fn render_day_of_and_passed() {
        let opp = opportunity(now() + Duration::hours(5));
        let day_of = Reminder::new(&opp, ReminderKind::DayOf, now());
        let msg = render_reminder(&day_of, &opp, now());
        assert!(msg.text.starts_with("DEADLINE TODAY!"));
        assert!(msg.text.contains("5h 0m"));
        assert_eq!(msg.actions, vec![Action::done(opp.id)]);

        let msg = render_reminder(&day_of, &opp, now() + Duration::hours(6));
        assert!(msg.text.starts_with("DEADLINE PASSED"));

        let week = Reminder::new(&opp, ReminderKind::SevenDays, now());
        let msg = render_reminder(&week, &opp, now());
        assert!(msg.text.contains("1 week left"));
    }

    struct Fixture {
        storage: Arc<SqliteStorage>,
        notifier: Arc<MemoryNotifier>,
        worker: DispatchWorker<SqliteStorage, MemoryNotifier>,
    }

    fn fixture(config: ReminderConfig) -> Fixture {
        let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let notifier = Arc::new(MemoryNotifier::new());
        let worker = DispatchWorker::new(
            Arc::clone(&storage),
            Arc::clone(&notifier),
            Arc::new(KeyedLocks::new()),
            &config,
        );
        Fixture {
            storage,
            notifier,
            worker,
        }
    }

    async fn insert_due(storage: &SqliteStorage) -> (Opportunity, Reminder) {
        let opp = opportunity(now() + Duration::days(3));
        let reminder = Reminder::new(&opp, ReminderKind::ThreeDays, now() - Duration::minutes(1));
        storage
            .create_opportunity(&opp, std::slice::from_ref(&reminder))
            .await
            .unwrap();
        (opp, reminder)
    }

    #[tokio::test]
    async fn tick_delivers_then_marks_sent() {
        let f = fixture(ReminderConfig::default());
        let (opp, reminder) = insert_due(&f.storage).await;

        let report = f.worker.tick(now()).await.unwrap();
        assert_eq!(report.delivered, 1);

        let sent = f.notifier.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].conversation_id, opp.conversation_id);
        assert!(f.storage.get_reminder(reminder.id).await.unwrap().sent);

        // Nothing left on the next tick.
        assert!(f.worker.tick(now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tick_retries_then_gives_up() {
        let f = fixture(ReminderConfig {
            max_attempts: 2,
            ..Default::default()
        });
        let (_, reminder) = insert_due(&f.storage).await;
        f.notifier.set_always_fail(true);

        let report = f.worker.tick(now()).await.unwrap();
        assert_eq!(report.retrying, 1);
        let report = f.worker.tick(now()).await.unwrap();
        assert_eq!(report.failed, 1);

        let stored = f.storage.get_reminder(reminder.id).await.unwrap();
        assert!(stored.failed);
        assert!(!stored.sent);
        assert_eq!(stored.attempts, 2);

        // Given up: no further attempts.
        assert!(f.worker.tick(now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_failure_then_success() {
        let f = fixture(ReminderConfig::default());
        let (_, reminder) = insert_due(&f.storage).await;
        f.notifier.fail_next(1);

        assert_eq!(f.worker.tick(now()).await.unwrap().retrying, 1);
        assert_eq!(f.worker.tick(now()).await.unwrap().delivered, 1);
        let stored = f.storage.get_reminder(reminder.id).await.unwrap();
        assert!(stored.sent);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_delivery_times_out() {
        let f = fixture(ReminderConfig {
            delivery_timeout_secs: 1,
            ..Default::default()
        });
        insert_due(&f.storage).await;
        f.notifier.set_delay(Some(StdDuration::from_secs(30)));

        let report = f.worker.tick(now()).await.unwrap();
        assert_eq!(report.retrying, 1);
        assert!(f.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn rejected_delivery_fails_without_retry() {
        let f = fixture(ReminderConfig::default());
        let (_, reminder) = insert_due(&f.storage).await;
        f.notifier.set_rejecting(true);

        let report = f.worker.tick(now()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.retrying, 0);

        let stored = f.storage.get_reminder(reminder.id).await.unwrap();
        assert!(stored.failed);
        assert!(!stored.sent);
        assert_eq!(stored.attempts, 1);
        assert!(f.worker.tick(now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn inactive_opportunity_is_skipped_and_marked() {
        let f = fixture(ReminderConfig::default());
        let (opp, reminder) = insert_due(&f.storage).await;
        // Status flips without cancelling, as a crash between the two could leave it.
        f.storage
            .update_opportunity(
                opp.id,
                &UpdateOpportunityInput::status(OpportunityStatus::Archived),
                None,
                crate::storage::ReminderChange::Keep,
            )
            .await
            .unwrap();

        let report = f.worker.tick(now()).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert!(f.notifier.sent().is_empty());
        assert!(f.storage.get_reminder(reminder.id).await.unwrap().sent);
    }
}
