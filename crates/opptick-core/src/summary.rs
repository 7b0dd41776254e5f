//! Time-bucketed views over a user's active opportunities, plus the daily
//! summary job that pushes one of them every day.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::ReminderConfig;
use crate::error::Result;
use crate::model::*;
use crate::notify::{send_within, Notifier, OutboundMessage};
use crate::storage::StorageBackend;

const WEEK_DAYS: i64 = 7;
const MONTH_DAYS: i64 = 30;
/// Items listed per bucket in a rendered summary.
const LIST_LIMIT: usize = 5;
/// Items listed in the daily summary.
const DAILY_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Overdue,
    ThisWeek,
    ThisMonth,
    Later,
}

/// Rolling windows from `now`: a deadline exactly seven days out is still
/// "this week".
pub fn bucket_of(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Bucket {
    if deadline < now {
        Bucket::Overdue
    } else if deadline <= now + Duration::days(WEEK_DAYS) {
        Bucket::ThisWeek
    } else if deadline <= now + Duration::days(MONTH_DAYS) {
        Bucket::ThisMonth
    } else {
        Bucket::Later
    }
}

/// Active opportunities partitioned by deadline, each bucket sorted by deadline.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Summary {
    pub overdue: Vec<Opportunity>,
    pub this_week: Vec<Opportunity>,
    pub this_month: Vec<Opportunity>,
    pub later: Vec<Opportunity>,
}

impl Summary {
    pub fn build(opportunities: impl IntoIterator<Item = Opportunity>, now: DateTime<Utc>) -> Self {
        let mut summary = Self::default();
        for opp in opportunities.into_iter().filter(Opportunity::is_active) {
            match bucket_of(opp.deadline, now) {
                Bucket::Overdue => summary.overdue.push(opp),
                Bucket::ThisWeek => summary.this_week.push(opp),
                Bucket::ThisMonth => summary.this_month.push(opp),
                Bucket::Later => summary.later.push(opp),
            }
        }
        for bucket in [
            &mut summary.overdue,
            &mut summary.this_week,
            &mut summary.this_month,
            &mut summary.later,
        ] {
            bucket.sort_by_key(|o| o.deadline);
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.overdue.len() + self.this_week.len() + self.this_month.len() + self.later.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Chat-ready text: counts per bucket, then the nearest items.
    pub fn render(&self, now: DateTime<Utc>) -> String {
        if self.is_empty() {
            return "No active opportunities to summarize.".to_string();
        }
        let mut out = String::from("Summary\n\n");
        for (label, items) in [
            ("Overdue", &self.overdue),
            ("This week", &self.this_week),
            ("This month", &self.this_month),
            ("Later", &self.later),
        ] {
            if !items.is_empty() {
                out.push_str(&format!("{label}: {}\n", items.len()));
            }
        }
        for (label, items) in [("This week", &self.this_week), ("This month", &self.this_month)] {
            if items.is_empty() {
                continue;
            }
            out.push_str(&format!("\n{label}:\n"));
            for opp in items.iter().take(LIST_LIMIT) {
                out.push_str(&format!(
                    "- {} ({}) - {}\n",
                    opp.title,
                    opp.short_id(),
                    format_countdown(opp.deadline, now)
                ));
            }
        }
        out.trim_end().to_string()
    }
}

/// `"3 days 4h 12m"`, `"4h 12m"`, `"12m"`, or `"OVERDUE"`.
pub fn format_countdown(deadline: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = deadline - now;
    if delta < Duration::zero() {
        return "OVERDUE".to_string();
    }
    let days = delta.num_days();
    let hours = delta.num_hours() % 24;
    let minutes = delta.num_minutes() % 60;
    if days > 0 {
        let unit = if days == 1 { "day" } else { "days" };
        format!("{days} {unit} {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

pub fn format_deadline(deadline: DateTime<Utc>) -> String {
    deadline.format("%Y-%m-%d %H:%M UTC").to_string()
}

/// Pushes a digest of upcoming deadlines to every user who enabled it, once
/// per date, at their configured time.
pub struct DailySummaryJob<S, N> {
    storage: Arc<S>,
    notifier: Arc<N>,
    poll_interval: StdDuration,
    delivery_timeout: StdDuration,
}

impl<S: StorageBackend, N: Notifier> DailySummaryJob<S, N> {
    pub fn new(storage: Arc<S>, notifier: Arc<N>, poll_interval: StdDuration) -> Self {
        Self {
            storage,
            notifier,
            poll_interval,
            delivery_timeout: ReminderConfig::default().delivery_timeout(),
        }
    }

    pub fn with_delivery_timeout(mut self, timeout: StdDuration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    /// Send every summary that is due at `now`. Returns how many were sent.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let today = now.date_naive();
        let mut sent = 0;

        for mut settings in self.storage.list_settings().await? {
            if !settings.daily_summary_enabled
                || now.time() < settings.daily_summary_time
                || settings.last_summary_on == Some(today)
            {
                continue;
            }

            let query = OpportunityQuery::for_owner(settings.owner_id.clone())
                .with_status(OpportunityStatus::Active);
            let upcoming: Vec<Opportunity> = self
                .storage
                .list_opportunities(&query)
                .await?
                .into_iter()
                .filter(|o| o.deadline > now && o.deadline <= now + Duration::days(MONTH_DAYS))
                .collect();

            if !upcoming.is_empty() {
                let message = OutboundMessage {
                    owner_id: settings.owner_id.clone(),
                    conversation_id: settings
                        .conversation_id
                        .clone()
                        .unwrap_or_else(|| settings.owner_id.clone()),
                    text: render_daily(&upcoming, now),
                    actions: Vec::new(),
                };
                if let Err(e) = send_within(self.notifier.as_ref(), &message, self.delivery_timeout).await {
                    tracing::warn!(owner = %settings.owner_id, error = %e, "daily summary not delivered");
                    continue;
                }
                sent += 1;
            }

            settings.last_summary_on = Some(today);
            self.storage.save_settings(&settings).await?;
        }

        if sent > 0 {
            tracing::info!(sent, "daily summaries sent");
        }
        Ok(sent)
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.run_due(Utc::now()).await {
                tracing::warn!(error = %e, "daily summary pass failed");
            }
        }
        tracing::debug!("daily summary job stopped");
    }
}

fn render_daily(upcoming: &[Opportunity], now: DateTime<Utc>) -> String {
    let mut out = format!("Daily summary: {} upcoming\n", upcoming.len());
    for opp in upcoming.iter().take(DAILY_LIMIT) {
        out.push_str(&format!(
            "\n[{}] {} ({})\n    {} - {}\n",
            opp.priority,
            opp.title,
            opp.category,
            format_countdown(opp.deadline, now),
            format_deadline(opp.deadline)
        ));
    }
    if upcoming.len() > DAILY_LIMIT {
        out.push_str(&format!("\n... and {} more", upcoming.len() - DAILY_LIMIT));
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::MemoryNotifier;
    use crate::storage::SqliteStorage;
    use chrono::{NaiveTime, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 21, 0, 0).unwrap()
    }

    fn opp(title: &str, deadline: DateTime<Utc>) -> Opportunity {
        Opportunity::new("alice".into(), "chat".into(), title.into(), deadline)
    }

    #[test]
    fn buckets_use_rolling_windows() {
        assert_eq!(bucket_of(now() - Duration::minutes(1), now()), Bucket::Overdue);
        assert_eq!(bucket_of(now(), now()), Bucket::ThisWeek);
        assert_eq!(bucket_of(now() + Duration::days(7), now()), Bucket::ThisWeek);
        assert_eq!(
            bucket_of(now() + Duration::days(7) + Duration::seconds(1), now()),
            Bucket::ThisMonth
        );
        assert_eq!(bucket_of(now() + Duration::days(30), now()), Bucket::ThisMonth);
        assert_eq!(bucket_of(now() + Duration::days(31), now()), Bucket::Later);
    }

    #[test]
    fn build_partitions_active_and_sorts() {
        let mut done = opp("done", now() + Duration::days(1));
        done.status = OpportunityStatus::Done;
        let summary = Summary::build(
            vec![
                opp("b", now() + Duration::days(5)),
                opp("a", now() + Duration::days(2)),
                opp("month", now() + Duration::days(20)),
                opp("later", now() + Duration::days(90)),
                opp("late", now() - Duration::days(1)),
                done,
            ],
            now(),
        );
        assert_eq!(summary.total(), 5);
        let week: Vec<&str> = summary.this_week.iter().map(|o| o.title.as_str()).collect();
        assert_eq!(week, vec!["a", "b"]);
        assert_eq!(summary.this_month.len(), 1);
        assert_eq!(summary.later.len(), 1);
        assert_eq!(summary.overdue.len(), 1);
    }

    #[test]
    fn render_lists_counts() {
        let summary = Summary::build(vec![opp("Acme", now() + Duration::days(2))], now());
        let text = summary.render(now());
        assert!(text.contains("This week: 1"));
        assert!(text.contains("- Acme"));
        assert!(Summary::default().render(now()).contains("No active"));
    }

    #[test]
    fn countdown_formats() {
        let n = now();
        assert_eq!(
            format_countdown(n + Duration::days(3) + Duration::hours(4) + Duration::minutes(12), n),
            "3 days 4h 12m"
        );
        assert_eq!(format_countdown(n + Duration::days(1), n), "1 day 0h 0m");
        assert_eq!(format_countdown(n + Duration::minutes(252), n), "4h 12m");
        assert_eq!(format_countdown(n + Duration::minutes(12), n), "12m");
        assert_eq!(format_countdown(n - Duration::minutes(1), n), "OVERDUE");
    }

    #[tokio::test]
    async fn daily_summary_sends_once_per_day() {
        let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let notifier = Arc::new(MemoryNotifier::new());
        let job = DailySummaryJob::new(
            Arc::clone(&storage),
            Arc::clone(&notifier),
            StdDuration::from_secs(60),
        );

        let mut settings = UserSettings::new(
            "alice".into(),
            true,
            NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
        );
        settings.conversation_id = Some("chat".into());
        storage.save_settings(&settings).await.unwrap();
        storage
            .create_opportunity(&opp("Acme", now() + Duration::days(3)), &[])
            .await
            .unwrap();
        storage
            .create_opportunity(&opp("Far", now() + Duration::days(60)), &[])
            .await
            .unwrap();

        // Before the configured time.
        let early = Utc.with_ymd_and_hms(2026, 6, 1, 19, 0, 0).unwrap();
        assert_eq!(job.run_due(early).await.unwrap(), 0);

        assert_eq!(job.run_due(now()).await.unwrap(), 1);
        assert_eq!(job.run_due(now() + Duration::minutes(5)).await.unwrap(), 0);

        let sent = notifier.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].conversation_id, "chat");
        assert!(sent[0].text.contains("Acme"));
        assert!(!sent[0].text.contains("Far"));

        let settings = storage.get_settings("alice").await.unwrap().unwrap();
        assert_eq!(settings.last_summary_on, Some(now().date_naive()));
    }

    #[tokio::test]
    async fn daily_summary_retries_after_failed_send() {
        let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let notifier = Arc::new(MemoryNotifier::new());
        let job = DailySummaryJob::new(
            Arc::clone(&storage),
            Arc::clone(&notifier),
            StdDuration::from_secs(60),
        );
        storage
            .save_settings(&UserSettings::new(
                "alice".into(),
                true,
                NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
            ))
            .await
            .unwrap();
        storage
            .create_opportunity(&opp("Acme", now() + Duration::days(3)), &[])
            .await
            .unwrap();

        notifier.fail_next(1);
        assert_eq!(job.run_due(now()).await.unwrap(), 0);
        assert_eq!(job.run_due(now()).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_summary_send_times_out() {
        let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let notifier = Arc::new(MemoryNotifier::new());
        let job = DailySummaryJob::new(
            Arc::clone(&storage),
            Arc::clone(&notifier),
            StdDuration::from_secs(60),
        )
        .with_delivery_timeout(StdDuration::from_secs(2));
        storage
            .save_settings(&UserSettings::new(
                "alice".into(),
                true,
                NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
            ))
            .await
            .unwrap();
        storage
            .create_opportunity(&opp("Acme", now() + Duration::days(3)), &[])
            .await
            .unwrap();
        notifier.set_delay(Some(StdDuration::from_secs(3600)));

        let started = tokio::time::Instant::now();
        assert_eq!(job.run_due(now()).await.unwrap(), 0);
        assert!(started.elapsed() < StdDuration::from_secs(60));

        let settings = storage.get_settings("alice").await.unwrap().unwrap();
        assert_eq!(settings.last_summary_on, None);
    }

    #[tokio::test]
    async fn disabled_users_get_nothing() {
        let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let notifier = Arc::new(MemoryNotifier::new());
        let job = DailySummaryJob::new(
            Arc::clone(&storage),
            Arc::clone(&notifier),
            StdDuration::from_secs(60),
        );
        storage
            .save_settings(&UserSettings::new(
                "alice".into(),
                false,
                NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
            ))
            .await
            .unwrap();
        storage
            .create_opportunity(&opp("Acme", now() + Duration::days(3)), &[])
            .await
            .unwrap();

        assert_eq!(job.run_due(now()).await.unwrap(), 0);
        assert!(notifier.sent().is_empty());
    }
}
