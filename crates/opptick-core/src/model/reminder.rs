use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Opportunity, Priority};

/// Which offset before the deadline a reminder represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReminderKind {
    #[serde(rename = "T-14d")]
    FourteenDays,
    #[serde(rename = "T-7d")]
    SevenDays,
    #[serde(rename = "T-3d")]
    ThreeDays,
    #[serde(rename = "T-2d")]
    TwoDays,
    #[serde(rename = "T-1d")]
    OneDay,
    #[serde(rename = "T-0d")]
    DayOf,
}

const STANDARD_TIER: &[ReminderKind] = &[
    ReminderKind::SevenDays,
    ReminderKind::ThreeDays,
    ReminderKind::OneDay,
    ReminderKind::DayOf,
];

const HIGH_TIER: &[ReminderKind] = &[
    ReminderKind::FourteenDays,
    ReminderKind::SevenDays,
    ReminderKind::ThreeDays,
    ReminderKind::TwoDays,
    ReminderKind::OneDay,
    ReminderKind::DayOf,
];

impl ReminderKind {
    /// Kinds dictated by a priority tier, earliest first.
    pub fn tier(priority: Priority) -> &'static [ReminderKind] {
        match priority {
            Priority::High => HIGH_TIER,
            Priority::Medium | Priority::Low => STANDARD_TIER,
        }
    }

    /// Offset before the deadline. `None` for the day-of reminder, which is
    /// pinned to a fixed hour instead.
    pub fn offset(&self) -> Option<Duration> {
        match self {
            Self::FourteenDays => Some(Duration::days(14)),
            Self::SevenDays => Some(Duration::days(7)),
            Self::ThreeDays => Some(Duration::days(3)),
            Self::TwoDays => Some(Duration::days(2)),
            Self::OneDay => Some(Duration::days(1)),
            Self::DayOf => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FourteenDays => "T-14d",
            Self::SevenDays => "T-7d",
            Self::ThreeDays => "T-3d",
            Self::TwoDays => "T-2d",
            Self::OneDay => "T-1d",
            Self::DayOf => "T-0d",
        }
    }

    /// Human description used in reminder texts.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::FourteenDays => "2 weeks left",
            Self::SevenDays => "1 week left",
            Self::ThreeDays => "3 days left",
            Self::TwoDays => "2 days left",
            Self::OneDay => "24 hours left",
            Self::DayOf => "deadline today",
        }
    }
}

impl std::fmt::Display for ReminderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReminderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "T-14d" => Ok(Self::FourteenDays),
            "T-7d" => Ok(Self::SevenDays),
            "T-3d" => Ok(Self::ThreeDays),
            "T-2d" => Ok(Self::TwoDays),
            "T-1d" => Ok(Self::OneDay),
            "T-0d" => Ok(Self::DayOf),
            _ => Err(format!("unknown reminder kind: {s}")),
        }
    }
}

/// A single scheduled notification for one opportunity and one offset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reminder {
    pub id: Uuid,
    pub opportunity_id: Uuid,
    pub owner_id: String,
    pub kind: ReminderKind,
    pub fire_at: DateTime<Utc>,
    /// Monotonic: once `true`, never reverts.
    pub sent: bool,
    /// Logically deleted by cancel or reschedule.
    #[serde(default)]
    pub cancelled: bool,
    /// Delivery gave up after the configured number of attempts.
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Reminder {
    pub fn new(opportunity: &Opportunity, kind: ReminderKind, fire_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            opportunity_id: opportunity.id,
            owner_id: opportunity.owner_id.clone(),
            kind,
            fire_at,
            sent: false,
            cancelled: false,
            failed: false,
            attempts: 0,
            last_error: None,
        }
    }

    /// Still waiting to fire: not sent, not cancelled, not given up on.
    pub fn is_pending(&self) -> bool {
        !self.sent && !self.cancelled && !self.failed
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.fire_at <= now
    }
}

/// A due reminder paired with its owning opportunity, as read by the dispatch worker.
#[derive(Debug, Clone)]
pub struct DueReminder {
    pub reminder: Reminder,
    pub opportunity: Opportunity,
}

/// How a new reminder set replaces the pending one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceMode {
    /// Keep pending rows whose `(kind, fire_at)` is unchanged, cancel the rest.
    KeepMatching,
    /// Cancel every pending row before inserting the new set.
    CancelAll,
}
