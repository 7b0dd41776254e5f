//! Daily scan for active opportunities whose deadline has passed.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{ReminderConfig, SweeperConfig};
use crate::error::Result;
use crate::locks::KeyedLocks;
use crate::model::*;
use crate::notify::{send_within, Action, Notifier, OutboundMessage};
use crate::storage::{ReminderChange, StorageBackend};
use crate::summary::format_deadline;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub prompted: usize,
    pub failed: usize,
}

/// Prompts the owner once per missed deadline, offering to archive it.
/// Never archives on its own.
pub struct MissedDeadlineSweeper<S, N> {
    storage: Arc<S>,
    notifier: Arc<N>,
    locks: Arc<KeyedLocks<Uuid>>,
    run_at: NaiveTime,
    delivery_timeout: StdDuration,
}

impl<S: StorageBackend, N: Notifier> MissedDeadlineSweeper<S, N> {
    pub fn new(
        storage: Arc<S>,
        notifier: Arc<N>,
        locks: Arc<KeyedLocks<Uuid>>,
        config: &SweeperConfig,
    ) -> Self {
        let run_at = NaiveTime::from_hms_opt(config.hour.min(23), config.minute.min(59), 0)
            .unwrap_or(NaiveTime::MIN);
        Self {
            storage,
            notifier,
            locks,
            run_at,
            delivery_timeout: ReminderConfig::default().delivery_timeout(),
        }
    }

    /// Bound each prompt send. Prompts go out under the opportunity lock
    /// that the dispatch worker also takes.
    pub fn with_delivery_timeout(mut self, timeout: StdDuration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    /// First scheduled run strictly after `now`.
    pub fn next_run(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive().and_time(self.run_at).and_utc();
        if today > now {
            today
        } else {
            today + Duration::days(1)
        }
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let query = OpportunityQuery {
            status: Some(OpportunityStatus::Active),
            deadline_before: Some(now),
            unprompted_only: true,
            ..Default::default()
        };
        let missed = self.storage.list_opportunities(&query).await?;
        let mut report = SweepReport::default();

        for candidate in missed {
            let _guard = self.locks.lock(candidate.id).await;

            // Edited, archived, or prompted since the scan.
            let opp = match self.storage.get_opportunity(candidate.id).await {
                Ok(opp) => opp,
                Err(e) => {
                    tracing::debug!(opportunity = %candidate.id, error = %e, "missed opportunity vanished");
                    continue;
                }
            };
            if !opp.is_active() || opp.deadline >= now || opp.missed_prompted_at.is_some() {
                continue;
            }

            let message = prompt(&opp);
            if let Err(e) = send_within(self.notifier.as_ref(), &message, self.delivery_timeout).await {
                tracing::warn!(opportunity = %opp.id, error = %e, "missed-deadline prompt not delivered");
                report.failed += 1;
                continue;
            }

            let mark = UpdateOpportunityInput {
                missed_prompted_at: Some(now),
                ..Default::default()
            };
            if let Err(e) = self
                .storage
                .update_opportunity(opp.id, &mark, Some(opp.version), ReminderChange::Keep)
                .await
            {
                tracing::warn!(opportunity = %opp.id, error = %e, "prompt sent but not recorded");
                report.failed += 1;
                continue;
            }
            report.prompted += 1;
        }

        if report.prompted > 0 || report.failed > 0 {
            tracing::info!(
                prompted = report.prompted,
                failed = report.failed,
                "missed-deadline sweep"
            );
        }
        Ok(report)
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            let now = Utc::now();
            let wait = (self.next_run(now) - now)
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            if let Err(e) = self.sweep(Utc::now()).await {
                tracing::warn!(error = %e, "missed-deadline sweep failed");
            }
        }
        tracing::debug!("sweeper stopped");
    }
}

fn prompt(opp: &Opportunity) -> OutboundMessage {
    OutboundMessage {
        owner_id: opp.owner_id.clone(),
        conversation_id: opp.conversation_id.clone(),
        text: format!(
            "Missed deadline\n\n{} ({})\nDeadline was: {}\n\nWould you like to archive it?",
            opp.title,
            opp.category,
            format_deadline(opp.deadline)
        ),
        actions: vec![Action::archive(opp.id), Action::keep(opp.id)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::MemoryNotifier;
    use crate::storage::SqliteStorage;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap()
    }

    struct Fixture {
        storage: Arc<SqliteStorage>,
        notifier: Arc<MemoryNotifier>,
        sweeper: MissedDeadlineSweeper<SqliteStorage, MemoryNotifier>,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let notifier = Arc::new(MemoryNotifier::new());
        let sweeper = MissedDeadlineSweeper::new(
            Arc::clone(&storage),
            Arc::clone(&notifier),
            Arc::new(KeyedLocks::new()),
            &SweeperConfig::default(),
        );
        Fixture {
            storage,
            notifier,
            sweeper,
        }
    }

    async fn insert(storage: &SqliteStorage, deadline: DateTime<Utc>) -> Opportunity {
        let opp = Opportunity::new("alice".into(), "chat".into(), "Acme".into(), deadline);
        storage.create_opportunity(&opp, &[]).await.unwrap();
        opp
    }

    #[tokio::test]
    async fn prompts_once_per_missed_deadline() {
        let f = fixture();
        let missed = insert(&f.storage, now() - Duration::days(1)).await;
        insert(&f.storage, now() + Duration::days(1)).await;

        let report = f.sweeper.sweep(now()).await.unwrap();
        assert_eq!(report, SweepReport { prompted: 1, failed: 0 });

        let sent = f.notifier.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].actions,
            vec![Action::archive(missed.id), Action::keep(missed.id)]
        );

        let stored = f.storage.get_opportunity(missed.id).await.unwrap();
        assert_eq!(stored.status, OpportunityStatus::Active);
        assert!(stored.missed_prompted_at.is_some());

        let report = f.sweeper.sweep(now() + Duration::days(1)).await.unwrap();
        assert_eq!(report.prompted, 0);
        assert!(f.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn failed_prompt_is_retried_next_run() {
        let f = fixture();
        let missed = insert(&f.storage, now() - Duration::days(1)).await;

        f.notifier.fail_next(1);
        let report = f.sweeper.sweep(now()).await.unwrap();
        assert_eq!(report, SweepReport { prompted: 0, failed: 1 });
        let stored = f.storage.get_opportunity(missed.id).await.unwrap();
        assert!(stored.missed_prompted_at.is_none());

        let report = f.sweeper.sweep(now()).await.unwrap();
        assert_eq!(report.prompted, 1);
    }

    /// Edits the opportunity a prompt is about while "sending" it, so the
    /// sweeper's versioned write afterwards conflicts.
    struct EditingNotifier {
        storage: Arc<SqliteStorage>,
        inner: MemoryNotifier,
        edited: std::sync::Mutex<bool>,
    }

    impl Notifier for EditingNotifier {
        async fn send(&self, message: &OutboundMessage) -> Result<()> {
            let first = !std::mem::replace(&mut *self.edited.lock().unwrap(), true);
            if first {
                let id = message.actions[0].value.trim_start_matches("archive:");
                let id = Uuid::parse_str(id).unwrap();
                let rename = UpdateOpportunityInput {
                    title: Some("Renamed".into()),
                    ..Default::default()
                };
                self.storage
                    .update_opportunity(id, &rename, None, ReminderChange::Keep)
                    .await?;
            }
            self.inner.send(message).await
        }
    }

    #[tokio::test]
    async fn failed_bookkeeping_does_not_stop_the_sweep() {
        let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let notifier = Arc::new(EditingNotifier {
            storage: Arc::clone(&storage),
            inner: MemoryNotifier::new(),
            edited: std::sync::Mutex::new(false),
        });
        let sweeper = MissedDeadlineSweeper::new(
            Arc::clone(&storage),
            Arc::clone(&notifier),
            Arc::new(KeyedLocks::new()),
            &SweeperConfig::default(),
        );
        let first = insert(&storage, now() - Duration::days(2)).await;
        let second = insert(&storage, now() - Duration::days(1)).await;

        let report = sweeper.sweep(now()).await.unwrap();
        assert_eq!(report, SweepReport { prompted: 1, failed: 1 });
        assert_eq!(notifier.inner.sent().len(), 2);

        let first = storage.get_opportunity(first.id).await.unwrap();
        assert!(first.missed_prompted_at.is_none());
        let second = storage.get_opportunity(second.id).await.unwrap();
        assert!(second.missed_prompted_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_prompt_gives_up_after_timeout() {
        let f = fixture();
        let sweeper = MissedDeadlineSweeper::new(
            Arc::clone(&f.storage),
            Arc::clone(&f.notifier),
            Arc::new(KeyedLocks::new()),
            &SweeperConfig::default(),
        )
        .with_delivery_timeout(StdDuration::from_secs(2));
        let missed = insert(&f.storage, now() - Duration::days(1)).await;
        f.notifier.set_delay(Some(StdDuration::from_secs(3600)));

        let started = tokio::time::Instant::now();
        let report = sweeper.sweep(now()).await.unwrap();
        assert!(started.elapsed() < StdDuration::from_secs(60));
        assert_eq!(report, SweepReport { prompted: 0, failed: 1 });

        let stored = f.storage.get_opportunity(missed.id).await.unwrap();
        assert!(stored.missed_prompted_at.is_none());
    }

    #[tokio::test]
    async fn archived_opportunities_are_ignored() {
        let f = fixture();
        let opp = insert(&f.storage, now() - Duration::days(1)).await;
        f.storage
            .update_opportunity(
                opp.id,
                &UpdateOpportunityInput::status(OpportunityStatus::Archived),
                None,
                ReminderChange::CancelPending,
            )
            .await
            .unwrap();

        assert_eq!(f.sweeper.sweep(now()).await.unwrap().prompted, 0);
    }

    #[test]
    fn next_run_is_daily_at_configured_time() {
        let f = fixture();
        let before = Utc.with_ymd_and_hms(2026, 6, 1, 8, 0, 0).unwrap();
        assert_eq!(f.sweeper.next_run(before), now());
        assert_eq!(f.sweeper.next_run(now()), now() + Duration::days(1));
    }
}
