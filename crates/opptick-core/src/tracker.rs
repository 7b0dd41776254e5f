//! User command surface: listing, inspecting and changing tracked
//! opportunities, plus per-user settings.
//!
//! Every mutation takes the opportunity's lock, re-reads the row and writes
//! with the version it read, so concurrent edits serialize and the pending
//! reminder set always matches the final state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::{parse_hhmm, OppTickConfig, SummaryConfig};
use crate::error::{OppTickError, Result};
use crate::extract::{DeadlineExtractor, PatternExtractor};
use crate::locks::KeyedLocks;
use crate::model::*;
use crate::scheduler::ReminderScheduler;
use crate::storage::{ReminderChange, StorageBackend};
use crate::summary::{format_deadline, Summary};

/// Result of an interactive action (`done:<id>`, `archive:<id>`, `keep:<id>`).
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Done(Opportunity),
    Archived(Opportunity),
    Kept(Opportunity),
}

impl ActionOutcome {
    pub fn opportunity(&self) -> &Opportunity {
        match self {
            Self::Done(o) | Self::Archived(o) | Self::Kept(o) => o,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Done(o) => format!("Marked done: {}", o.title),
            Self::Archived(o) => format!("Archived: {}", o.title),
            Self::Kept(o) => format!("Kept active: {}", o.title),
        }
    }
}

/// Create the owner's settings row from the configured defaults if it does
/// not exist yet. Records `conversation_id` as the summary destination when
/// none is set.
pub async fn ensure_settings<S: StorageBackend>(
    storage: &S,
    owner_id: &str,
    conversation_id: Option<&str>,
    defaults: &SummaryConfig,
) -> Result<UserSettings> {
    match storage.get_settings(owner_id).await? {
        Some(mut settings) => {
            if settings.conversation_id.is_none() {
                if let Some(conversation) = conversation_id {
                    settings.conversation_id = Some(conversation.to_string());
                    storage.save_settings(&settings).await?;
                }
            }
            Ok(settings)
        }
        None => {
            let mut settings = UserSettings::new(
                owner_id.to_string(),
                defaults.default_enabled,
                defaults.default_time(),
            );
            settings.conversation_id = conversation_id.map(str::to_string);
            storage.save_settings(&settings).await?;
            tracing::info!(owner = %owner_id, "created user settings");
            Ok(settings)
        }
    }
}

pub struct Tracker<S, E = PatternExtractor> {
    storage: Arc<S>,
    scheduler: ReminderScheduler<S>,
    locks: Arc<KeyedLocks<Uuid>>,
    extractor: E,
    min_confidence: f32,
    summary_defaults: SummaryConfig,
}

impl<S: StorageBackend> Tracker<S, PatternExtractor> {
    pub fn new(storage: Arc<S>, locks: Arc<KeyedLocks<Uuid>>, config: &OppTickConfig) -> Self {
        Self::with_extractor(storage, locks, PatternExtractor::new(), config)
    }
}

impl<S: StorageBackend, E: DeadlineExtractor> Tracker<S, E> {
    pub fn with_extractor(
        storage: Arc<S>,
        locks: Arc<KeyedLocks<Uuid>>,
        extractor: E,
        config: &OppTickConfig,
    ) -> Self {
        Self {
            scheduler: ReminderScheduler::new(Arc::clone(&storage), &config.reminders),
            storage,
            locks,
            extractor,
            min_confidence: config.intake.min_confidence,
            summary_defaults: config.summary.clone(),
        }
    }

    // -- Reads --

    pub async fn list_active(&self, owner_id: &str) -> Result<Vec<Opportunity>> {
        let query = OpportunityQuery::for_owner(owner_id)
            .with_status(OpportunityStatus::Active);
        self.storage.list_opportunities(&query).await
    }

    /// Done and archived opportunities, by deadline.
    pub async fn list_archived(&self, owner_id: &str) -> Result<Vec<Opportunity>> {
        let query = OpportunityQuery::for_owner(owner_id)
            .without_status(OpportunityStatus::Active);
        self.storage.list_opportunities(&query).await
    }

    /// Resolve a full id or an id prefix to one of the owner's opportunities.
    pub async fn resolve_id(&self, owner_id: &str, id_or_prefix: &str) -> Result<Uuid> {
        let needle = id_or_prefix.trim();
        if let Ok(id) = Uuid::parse_str(needle) {
            return self.owned(owner_id, id).await.map(|o| o.id);
        }
        let matches = self.storage.find_by_id_prefix(owner_id, needle).await?;
        match matches.as_slice() {
            [] => Err(OppTickError::NotFound(format!("no opportunity matching '{needle}'"))),
            [one] => Ok(one.id),
            many => Err(OppTickError::Ambiguous(format!(
                "'{needle}' matches {} opportunities, use a longer prefix",
                many.len()
            ))),
        }
    }

    pub async fn get(&self, owner_id: &str, id_or_prefix: &str) -> Result<Opportunity> {
        let id = self.resolve_id(owner_id, id_or_prefix).await?;
        self.storage.get_opportunity(id).await
    }

    /// Reminders of an opportunity, pending or not, by fire time.
    pub async fn reminders(&self, owner_id: &str, id_or_prefix: &str) -> Result<Vec<Reminder>> {
        let id = self.resolve_id(owner_id, id_or_prefix).await?;
        self.storage.list_reminders(id, false).await
    }

    pub async fn summary(&self, owner_id: &str, now: DateTime<Utc>) -> Result<Summary> {
        Ok(Summary::build(self.list_active(owner_id).await?, now))
    }

    // -- Mutations --

    /// Remove the opportunity and all of its reminders.
    pub async fn delete(&self, owner_id: &str, id_or_prefix: &str) -> Result<Opportunity> {
        let id = self.resolve_id(owner_id, id_or_prefix).await?;
        let _guard = self.locks.lock(id).await;
        let opp = self.owned(owner_id, id).await?;
        self.storage.delete_opportunity(id).await?;
        tracing::info!(opportunity = %id, owner = %owner_id, "deleted opportunity");
        Ok(opp)
    }

    pub async fn archive(&self, owner_id: &str, id_or_prefix: &str) -> Result<Opportunity> {
        let id = self.resolve_id(owner_id, id_or_prefix).await?;
        self.set_status(owner_id, id, OpportunityStatus::Archived).await
    }

    pub async fn mark_done(&self, owner_id: &str, id_or_prefix: &str) -> Result<Opportunity> {
        let id = self.resolve_id(owner_id, id_or_prefix).await?;
        self.set_status(owner_id, id, OpportunityStatus::Done).await
    }

    async fn set_status(&self, owner_id: &str, id: Uuid, status: OpportunityStatus) -> Result<Opportunity> {
        let _guard = self.locks.lock(id).await;
        let opp = self.owned(owner_id, id).await?;
        if opp.status == status {
            return Ok(opp);
        }
        let updated = self
            .storage
            .update_opportunity(
                id,
                &UpdateOpportunityInput::status(status),
                Some(opp.version),
                ReminderChange::CancelPending,
            )
            .await?;
        tracing::info!(opportunity = %id, status = %status, "opportunity status changed");
        Ok(updated)
    }

    /// Parse `text` as a new deadline and reschedule. The best candidate must
    /// be in the future and confident enough; anything else is rejected.
    pub async fn edit_deadline(
        &self,
        owner_id: &str,
        id_or_prefix: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<(Opportunity, Vec<Reminder>)> {
        let future: Vec<_> = self
            .extractor
            .extract(text, now)
            .into_iter()
            .filter(|c| c.at > now)
            .collect();
        let deadline = match future.first() {
            None => {
                return Err(OppTickError::InvalidInput(format!(
                    "could not read a future deadline from '{}'",
                    text.trim()
                )))
            }
            Some(best) if best.confidence < self.min_confidence => {
                return Err(OppTickError::InvalidInput(format!(
                    "'{}' is ambiguous, use YYYY-MM-DD",
                    best.matched
                )))
            }
            Some(best) => best.at,
        };
        self.edit_deadline_at(owner_id, id_or_prefix, deadline, now).await
    }

    /// Set the deadline and replace the pending reminders with a fresh plan,
    /// in one write.
    pub async fn edit_deadline_at(
        &self,
        owner_id: &str,
        id_or_prefix: &str,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(Opportunity, Vec<Reminder>)> {
        if deadline <= now {
            return Err(OppTickError::InvalidInput(format!(
                "deadline {} is in the past",
                format_deadline(deadline)
            )));
        }
        let id = self.resolve_id(owner_id, id_or_prefix).await?;
        let _guard = self.locks.lock(id).await;
        let current = self.owned(owner_id, id).await?;

        let mut target = current.clone();
        target.deadline = deadline;
        let reminders = self.scheduler.build(&target, now);

        let updated = self
            .storage
            .update_opportunity(
                id,
                &UpdateOpportunityInput::deadline(deadline),
                Some(current.version),
                ReminderChange::Replace(reminders.clone()),
            )
            .await?;
        tracing::info!(
            opportunity = %id,
            deadline = %deadline,
            reminders = reminders.len(),
            "deadline changed"
        );
        Ok((updated, reminders))
    }

    /// Apply an interactive action value sent back by the transport.
    pub async fn handle_action(&self, owner_id: &str, value: &str) -> Result<ActionOutcome> {
        let (verb, id) = value
            .split_once(':')
            .ok_or_else(|| OppTickError::InvalidInput(format!("malformed action '{value}'")))?;
        let id = Uuid::parse_str(id.trim())
            .map_err(|_| OppTickError::InvalidInput(format!("malformed action '{value}'")))?;

        match verb {
            "done" => Ok(ActionOutcome::Done(
                self.set_status(owner_id, id, OpportunityStatus::Done).await?,
            )),
            "archive" => Ok(ActionOutcome::Archived(
                self.set_status(owner_id, id, OpportunityStatus::Archived).await?,
            )),
            "keep" => Ok(ActionOutcome::Kept(self.owned(owner_id, id).await?)),
            other => Err(OppTickError::InvalidInput(format!("unknown action '{other}'"))),
        }
    }

    // -- Settings --

    pub async fn ensure_settings(&self, owner_id: &str, conversation_id: Option<&str>) -> Result<UserSettings> {
        ensure_settings(&*self.storage, owner_id, conversation_id, &self.summary_defaults).await
    }

    pub async fn settings(&self, owner_id: &str) -> Result<UserSettings> {
        self.ensure_settings(owner_id, None).await
    }

    /// Change the daily summary switch and/or time. The time is validated
    /// before anything is written.
    pub async fn update_settings(
        &self,
        owner_id: &str,
        enabled: Option<bool>,
        time: Option<&str>,
    ) -> Result<UserSettings> {
        let time = match time {
            Some(raw) => Some(parse_hhmm(raw).ok_or_else(|| {
                OppTickError::InvalidInput(format!("invalid time '{raw}', expected HH:MM"))
            })?),
            None => None,
        };
        let mut settings = self.ensure_settings(owner_id, None).await?;
        if let Some(enabled) = enabled {
            settings.daily_summary_enabled = enabled;
        }
        if let Some(time) = time {
            settings.daily_summary_time = time;
        }
        self.storage.save_settings(&settings).await?;
        Ok(settings)
    }

    /// Fetch by id, hiding other owners' rows as not found.
    async fn owned(&self, owner_id: &str, id: Uuid) -> Result<Opportunity> {
        let opp = self.storage.get_opportunity(id).await?;
        if opp.owner_id != owner_id {
            return Err(OppTickError::NotFound(format!("opportunity {id}")));
        }
        Ok(opp)
    }
}
