use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::model::*;

/// What happens to an opportunity's pending reminders alongside an update.
#[derive(Debug, Clone, Default)]
pub enum ReminderChange {
    #[default]
    Keep,
    /// Mark every pending reminder cancelled.
    CancelPending,
    /// Cancel every pending reminder and insert these instead.
    Replace(Vec<Reminder>),
}

/// Row counts reported by `opptick status`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StoreStats {
    pub opportunities: usize,
    pub active: usize,
    pub pending_reminders: usize,
    pub sessions: usize,
}

/// Persistence contract for opportunities, reminders, intake sessions and
/// user settings.
///
/// Every method that touches more than one row runs in a single transaction,
/// so the dispatch worker never observes a half-applied change.
pub trait StorageBackend: Send + Sync {
    // -- Opportunities --

    /// Insert an opportunity together with its reminder timetable.
    fn create_opportunity(
        &self,
        opportunity: &Opportunity,
        reminders: &[Reminder],
    ) -> impl Future<Output = Result<()>> + Send;

    fn get_opportunity(&self, id: Uuid) -> impl Future<Output = Result<Opportunity>> + Send;

    /// Opportunities matching the query, ordered by deadline ascending.
    fn list_opportunities(
        &self,
        query: &OpportunityQuery,
    ) -> impl Future<Output = Result<Vec<Opportunity>>> + Send;

    /// Opportunities of `owner_id` whose id starts with `prefix`.
    fn find_by_id_prefix(
        &self,
        owner_id: &str,
        prefix: &str,
    ) -> impl Future<Output = Result<Vec<Opportunity>>> + Send;

    /// Apply `input` and `reminders` atomically. Fails with `Conflict` when
    /// `expected_version` is given and differs from the stored version.
    fn update_opportunity(
        &self,
        id: Uuid,
        input: &UpdateOpportunityInput,
        expected_version: Option<i64>,
        reminders: ReminderChange,
    ) -> impl Future<Output = Result<Opportunity>> + Send;

    /// Delete an opportunity and all of its reminders.
    fn delete_opportunity(&self, id: Uuid) -> impl Future<Output = Result<()>> + Send;

    // -- Reminders --

    /// Replace the pending reminder set of one opportunity. Returns the
    /// resulting pending set ordered by `fire_at`.
    fn replace_pending_reminders(
        &self,
        opportunity_id: Uuid,
        reminders: &[Reminder],
        mode: ReplaceMode,
    ) -> impl Future<Output = Result<Vec<Reminder>>> + Send;

    /// Mark every pending reminder of the opportunity cancelled. Returns how many.
    fn cancel_pending_reminders(
        &self,
        opportunity_id: Uuid,
    ) -> impl Future<Output = Result<usize>> + Send;

    fn get_reminder(&self, id: Uuid) -> impl Future<Output = Result<Reminder>> + Send;

    /// Reminders of one opportunity ordered by `fire_at`.
    fn list_reminders(
        &self,
        opportunity_id: Uuid,
        pending_only: bool,
    ) -> impl Future<Output = Result<Vec<Reminder>>> + Send;

    /// Pending reminders with `fire_at <= now`, joined with their opportunity,
    /// oldest first.
    fn due_reminders(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<DueReminder>>> + Send;

    /// Set `sent`. Returns `false` when the reminder was no longer pending.
    fn mark_reminder_sent(&self, id: Uuid) -> impl Future<Output = Result<bool>> + Send;

    /// Count a failed delivery. Once `attempts` reaches `max_attempts` the
    /// reminder is marked `failed`.
    fn record_reminder_failure(
        &self,
        id: Uuid,
        error: &str,
        max_attempts: u32,
    ) -> impl Future<Output = Result<Reminder>> + Send;

    // -- Intake sessions --

    fn get_session(
        &self,
        owner_id: &str,
        conversation_id: &str,
    ) -> impl Future<Output = Result<Option<IntakeSession>>> + Send;

    /// Insert or replace the session for its `(owner_id, conversation_id)`.
    fn save_session(&self, session: &IntakeSession) -> impl Future<Output = Result<()>> + Send;

    fn delete_session(
        &self,
        owner_id: &str,
        conversation_id: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Remove sessions with `expires_at <= now`. Returns how many.
    fn delete_expired_sessions(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<usize>> + Send;

    // -- User settings --

    fn get_settings(
        &self,
        owner_id: &str,
    ) -> impl Future<Output = Result<Option<UserSettings>>> + Send;

    fn save_settings(&self, settings: &UserSettings) -> impl Future<Output = Result<()>> + Send;

    fn list_settings(&self) -> impl Future<Output = Result<Vec<UserSettings>>> + Send;

    // -- Introspection --

    fn stats(&self, owner_id: Option<&str>) -> impl Future<Output = Result<StoreStats>> + Send;
}
