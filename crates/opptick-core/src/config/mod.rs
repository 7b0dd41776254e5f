use crate::error::{OppTickError, Result};
use chrono::NaiveTime;
use config::{Config, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OppTickConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub intake: IntakeConfig,
    #[serde(default)]
    pub reminders: ReminderConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub summary: SummaryConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: String,
    /// Custom path for the SQLite database. Defaults to `~/.config/opptick/opptick.db`.
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeConfig {
    /// Minutes of inactivity after which an unfinished intake dialog is discarded.
    #[serde(default = "default_session_idle_minutes")]
    pub session_idle_minutes: i64,
    /// Extractor candidates below this confidence are offered as a choice
    /// instead of a single proposal.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            session_idle_minutes: default_session_idle_minutes(),
            min_confidence: default_min_confidence(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReminderConfig {
    /// Hour (reference clock) the day-of reminder fires at.
    #[serde(default = "default_day_of_hour")]
    pub day_of_hour: u32,
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    #[serde(default = "default_delivery_timeout_secs")]
    pub delivery_timeout_secs: u64,
    /// Failed deliveries before a reminder is given up on.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            day_of_hour: default_day_of_hour(),
            tick_secs: default_tick_secs(),
            delivery_timeout_secs: default_delivery_timeout_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl ReminderConfig {
    /// Upper bound on a single notifier send, shared by every background job.
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_sweeper_hour")]
    pub hour: u32,
    #[serde(default)]
    pub minute: u32,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            hour: default_sweeper_hour(),
            minute: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryConfig {
    /// Whether new users get the daily summary.
    #[serde(default = "default_true")]
    pub default_enabled: bool,
    /// `HH:MM` on the reference clock.
    #[serde(default = "default_summary_time")]
    pub default_time: String,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            default_enabled: true,
            default_time: default_summary_time(),
        }
    }
}

impl SummaryConfig {
    /// Parsed `default_time`, falling back to 20:00 when unparseable.
    pub fn default_time(&self) -> NaiveTime {
        parse_hhmm(&self.default_time).unwrap_or_else(fallback_summary_time)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IdentityConfig {
    /// Owner id used by the CLI when `--user` is not given.
    #[serde(default)]
    pub owner_id: Option<String>,
}

/// Valid storage backend names.
pub const VALID_STORAGE_BACKENDS: &[&str] = &["sqlite"];

fn default_storage_backend() -> String {
    "sqlite".to_string()
}
fn default_session_idle_minutes() -> i64 {
    30
}
fn default_min_confidence() -> f32 {
    0.5
}
fn default_day_of_hour() -> u32 {
    9
}
fn default_tick_secs() -> u64 {
    60
}
fn default_delivery_timeout_secs() -> u64 {
    10
}
fn default_max_attempts() -> u32 {
    5
}
fn default_sweeper_hour() -> u32 {
    9
}
fn default_true() -> bool {
    true
}
fn default_summary_time() -> String {
    "20:00".to_string()
}
fn fallback_summary_time() -> NaiveTime {
    NaiveTime::from_hms_opt(20, 0, 0).unwrap_or(NaiveTime::MIN)
}

/// Parse an `HH:MM` time of day.
pub fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").ok()
}

impl OppTickConfig {
    /// Load configuration with three-layer TOML merge:
    /// 1. ~/.config/opptick/config.toml (global)
    /// 2. .opptick/config.toml (project)
    /// 3. .opptick/config.local.toml (local, gitignored)
    pub fn load(project_dir: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        // Layer 1: Global config
        if let Some(global_path) = global_config_path() {
            if global_path.exists() {
                builder = builder.add_source(File::from(global_path).required(false));
            }
        }

        // Layer 2: Project config
        if let Some(dir) = project_dir {
            let project_config = dir.join(".opptick").join("config.toml");
            if project_config.exists() {
                builder = builder.add_source(File::from(project_config).required(false));
            }

            // Layer 3: Local config (gitignored)
            let local_config = dir.join(".opptick").join("config.local.toml");
            if local_config.exists() {
                builder = builder.add_source(File::from(local_config).required(false));
            }
        }

        let config = builder
            .build()
            .map_err(|e| OppTickError::Config(e.to_string()))?;

        let mut cfg: Self = config
            .try_deserialize()
            .map_err(|e| OppTickError::Config(e.to_string()))?;

        cfg.validate();
        Ok(cfg)
    }

    /// Load with defaults only (no files).
    pub fn default_config() -> Self {
        Self {
            storage: StorageConfig::default(),
            intake: IntakeConfig::default(),
            reminders: ReminderConfig::default(),
            sweeper: SweeperConfig::default(),
            summary: SummaryConfig::default(),
            identity: IdentityConfig::default(),
        }
    }

    /// Validate config values, clamping out-of-range values and logging warnings.
    /// Lenient: fixes values rather than rejecting the config.
    pub fn validate(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !VALID_STORAGE_BACKENDS.contains(&self.storage.backend.as_str()) {
            warnings.push(format!(
                "unknown storage backend '{}', valid: {}",
                self.storage.backend,
                VALID_STORAGE_BACKENDS.join(", ")
            ));
        }

        let confidence = self.intake.min_confidence;
        if !(0.0..=1.0).contains(&confidence) {
            warnings.push(format!(
                "intake.min_confidence = {confidence} out of range [0.0, 1.0], clamping"
            ));
            self.intake.min_confidence = confidence.clamp(0.0, 1.0);
        }

        if self.intake.session_idle_minutes <= 0 {
            warnings.push(format!(
                "intake.session_idle_minutes = {}, setting to 1",
                self.intake.session_idle_minutes
            ));
            self.intake.session_idle_minutes = 1;
        }

        // Hours and minutes
        let clock_checks: Vec<(&str, &mut u32, u32)> = vec![
            ("reminders.day_of_hour", &mut self.reminders.day_of_hour, 23),
            ("sweeper.hour", &mut self.sweeper.hour, 23),
            ("sweeper.minute", &mut self.sweeper.minute, 59),
        ];
        for (name, val, max) in clock_checks {
            if *val > max {
                warnings.push(format!("{name} = {val} out of range [0, {max}], clamping"));
                *val = max;
            }
        }

        // Positive integer checks
        if self.reminders.tick_secs == 0 {
            warnings.push("reminders.tick_secs = 0, setting to 1".to_string());
            self.reminders.tick_secs = 1;
        }
        if self.reminders.delivery_timeout_secs == 0 {
            warnings.push("reminders.delivery_timeout_secs = 0, setting to 1".to_string());
            self.reminders.delivery_timeout_secs = 1;
        }
        if self.reminders.max_attempts == 0 {
            warnings.push("reminders.max_attempts = 0, setting to 1".to_string());
            self.reminders.max_attempts = 1;
        }

        if parse_hhmm(&self.summary.default_time).is_none() {
            warnings.push(format!(
                "summary.default_time '{}' is not HH:MM, using 20:00",
                self.summary.default_time
            ));
            self.summary.default_time = default_summary_time();
        }

        // Log warnings via tracing (if subscriber is set up)
        for w in &warnings {
            tracing::warn!("config: {}", w);
        }

        warnings
    }

    /// Resolve the SQLite path: configured path or `~/.config/opptick/opptick.db`.
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.storage.path {
            Some(p) => Ok(PathBuf::from(p)),
            None => dirs::config_dir()
                .map(|p| p.join("opptick").join("opptick.db"))
                .ok_or_else(|| {
                    OppTickError::Config("cannot determine config directory".to_string())
                }),
        }
    }
}

fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("opptick").join("config.toml"))
}

/// Resolve the current user's identity.
///
/// Priority: explicit value → config `identity.owner_id` → `$USER` → `"local"`
pub fn resolve_owner_id(explicit: Option<&str>, config: &IdentityConfig) -> String {
    if let Some(id) = explicit.filter(|s| !s.trim().is_empty()) {
        return id.trim().to_string();
    }
    if let Some(ref id) = config.owner_id {
        if !id.trim().is_empty() {
            return id.trim().to_string();
        }
    }
    std::env::var("USER")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| "local".to_string())
}
