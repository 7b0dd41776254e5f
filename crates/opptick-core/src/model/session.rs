use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Category, Priority};

/// Node of the intake dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntakeState {
    AwaitingForward,
    DeadlineProposed,
    AwaitingManualDeadline,
    DeadlineConfirmed,
    TypeSelection,
    PrioritySelection,
    TitleConfirmation,
    Saved,
}

impl std::fmt::Display for IntakeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AwaitingForward => "awaiting_forward",
            Self::DeadlineProposed => "deadline_proposed",
            Self::AwaitingManualDeadline => "awaiting_manual_deadline",
            Self::DeadlineConfirmed => "deadline_confirmed",
            Self::TypeSelection => "type_selection",
            Self::PrioritySelection => "priority_selection",
            Self::TitleConfirmation => "title_confirmation",
            Self::Saved => "saved",
        };
        f.write_str(s)
    }
}

/// A deadline the extractor proposed, kept in the draft so the user can pick it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedDeadline {
    pub at: DateTime<Utc>,
    pub confidence: f32,
    pub matched: String,
}

/// Partially filled opportunity fields plus extractor metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub source_text: String,
    #[serde(default)]
    pub source_ref: Option<String>,
    #[serde(default)]
    pub is_forward: bool,
    /// Candidates offered in `DeadlineProposed`, best first.
    #[serde(default)]
    pub proposals: Vec<ProposedDeadline>,
    /// Index into `proposals` accepted by a plain "yes". `None` when the
    /// proposals are ambiguous and the user must pick one.
    #[serde(default)]
    pub default_proposal: Option<usize>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub suggested_category: Option<Category>,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub suggested_title: String,
}

/// Per-conversation intake dialog, keyed by `(owner_id, conversation_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntakeSession {
    pub owner_id: String,
    pub conversation_id: String,
    pub state: IntakeState,
    pub draft: Draft,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IntakeSession {
    pub fn new(
        owner_id: String,
        conversation_id: String,
        now: DateTime<Utc>,
        idle: Duration,
    ) -> Self {
        Self {
            owner_id,
            conversation_id,
            state: IntakeState::AwaitingForward,
            draft: Draft::default(),
            created_at: now,
            updated_at: now,
            expires_at: now + idle,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Extend the idle window after a mutation.
    pub fn touch(&mut self, now: DateTime<Utc>, idle: Duration) {
        self.updated_at = now;
        self.expires_at = now + idle;
    }
}

/// Per-user configuration. One row per owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSettings {
    pub owner_id: String,
    /// Conversation the daily summary is delivered to.
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub daily_summary_enabled: bool,
    pub daily_summary_time: NaiveTime,
    #[serde(default)]
    pub last_summary_on: Option<NaiveDate>,
}

impl UserSettings {
    pub fn new(owner_id: String, enabled: bool, time: NaiveTime) -> Self {
        Self {
            owner_id,
            conversation_id: None,
            daily_summary_enabled: enabled,
            daily_summary_time: time,
            last_summary_on: None,
        }
    }
}
