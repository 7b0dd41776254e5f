use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{OppTickError, Result};

pub const MAX_TITLE_LENGTH: usize = 100;

/// Validate a title before it is committed.
pub fn validate_title(title: &str) -> Result<()> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(OppTickError::InvalidInput("title cannot be empty".into()));
    }
    if trimmed.chars().count() > MAX_TITLE_LENGTH {
        return Err(OppTickError::InvalidInput(format!(
            "title exceeds maximum length of {MAX_TITLE_LENGTH} characters"
        )));
    }
    Ok(())
}

/// A tracked, deadlined item owned by one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Opportunity {
    pub id: Uuid,
    pub owner_id: String,
    /// Conversation that notifications for this opportunity go to.
    pub conversation_id: String,
    pub title: String,
    pub category: Category,
    pub priority: Priority,
    pub deadline: DateTime<Utc>,
    pub status: OpportunityStatus,
    pub source_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once the missed-deadline sweeper has prompted the owner.
    #[serde(default)]
    pub missed_prompted_at: Option<DateTime<Utc>>,
    #[serde(default = "default_version")]
    pub version: i64,
}

fn default_version() -> i64 {
    1
}

impl Opportunity {
    pub fn new(
        owner_id: String,
        conversation_id: String,
        title: String,
        deadline: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            owner_id,
            conversation_id,
            title,
            category: Category::Other,
            priority: Priority::default(),
            deadline,
            status: OpportunityStatus::Active,
            source_ref: None,
            created_at: now,
            updated_at: now,
            missed_prompted_at: None,
            version: default_version(),
        }
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_source_ref(mut self, source_ref: impl Into<String>) -> Self {
        self.source_ref = Some(source_ref.into());
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.updated_at = at;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == OpportunityStatus::Active
    }

    /// First 8 characters of the id, as shown in listings.
    pub fn short_id(&self) -> String {
        self.id.to_string()[..8].to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Internship,
    Scholarship,
    Event,
    Job,
    Other,
}

impl Category {
    /// Selection order offered to the user.
    pub const ALL: [Category; 5] = [
        Self::Internship,
        Self::Scholarship,
        Self::Event,
        Self::Job,
        Self::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Internship => "internship",
            Self::Scholarship => "scholarship",
            Self::Event => "event",
            Self::Job => "job",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Internship => write!(f, "Internship"),
            Self::Scholarship => write!(f, "Scholarship"),
            Self::Event => write!(f, "Event"),
            Self::Job => write!(f, "Job"),
            Self::Other => write!(f, "Other"),
        }
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "internship" => Ok(Self::Internship),
            "scholarship" => Ok(Self::Scholarship),
            "event" => Ok(Self::Event),
            "job" => Ok(Self::Job),
            "other" => Ok(Self::Other),
            _ => Err(format!("unknown category: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Self::High, Self::Medium, Self::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => write!(f, "High"),
            Self::Medium => write!(f, "Medium"),
            Self::Low => write!(f, "Low"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            _ => Err(format!("unknown priority: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityStatus {
    #[default]
    Active,
    Done,
    Archived,
}

impl OpportunityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Done => "done",
            Self::Archived => "archived",
        }
    }
}

impl std::fmt::Display for OpportunityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OpportunityStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "done" => Ok(Self::Done),
            "archived" => Ok(Self::Archived),
            _ => Err(format!("unknown status: {s}")),
        }
    }
}

/// Partial update of an opportunity. `None` leaves a field untouched.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpdateOpportunityInput {
    pub title: Option<String>,
    pub category: Option<Category>,
    pub priority: Option<Priority>,
    pub deadline: Option<DateTime<Utc>>,
    pub status: Option<OpportunityStatus>,
    pub missed_prompted_at: Option<DateTime<Utc>>,
}

impl UpdateOpportunityInput {
    pub fn status(status: OpportunityStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn deadline(deadline: DateTime<Utc>) -> Self {
        Self {
            deadline: Some(deadline),
            ..Default::default()
        }
    }

    /// Apply the changes to `opp` in place, bumping version and `updated_at`.
    pub fn apply_to(&self, opp: &mut Opportunity, now: DateTime<Utc>) {
        if let Some(ref title) = self.title {
            opp.title = title.trim().to_string();
        }
        if let Some(category) = self.category {
            opp.category = category;
        }
        if let Some(priority) = self.priority {
            opp.priority = priority;
        }
        if let Some(deadline) = self.deadline {
            opp.deadline = deadline;
            // A new deadline may be missed again later.
            opp.missed_prompted_at = None;
        }
        if let Some(status) = self.status {
            opp.status = status;
        }
        if let Some(at) = self.missed_prompted_at {
            opp.missed_prompted_at = Some(at);
        }
        opp.updated_at = now;
        opp.version += 1;
    }
}

/// Listing filter. All set fields must match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpportunityQuery {
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub status: Option<OpportunityStatus>,
    /// Leave out opportunities with this status.
    #[serde(default)]
    pub exclude_status: Option<OpportunityStatus>,
    /// Only opportunities whose deadline is strictly before this instant.
    #[serde(default)]
    pub deadline_before: Option<DateTime<Utc>>,
    /// Only opportunities the sweeper has not prompted about yet.
    #[serde(default)]
    pub unprompted_only: bool,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    1000
}

impl Default for OpportunityQuery {
    fn default() -> Self {
        Self {
            owner_id: None,
            status: None,
            exclude_status: None,
            deadline_before: None,
            unprompted_only: false,
            limit: default_limit(),
        }
    }
}

impl OpportunityQuery {
    pub fn for_owner(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: Some(owner_id.into()),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: OpportunityStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn without_status(mut self, status: OpportunityStatus) -> Self {
        self.exclude_status = Some(status);
        self
    }
}
