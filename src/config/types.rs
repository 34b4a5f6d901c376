use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    pub policy: GlobalPolicy,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Global backup policy: executables, repository credentials, trigger flags,
/// tag literals, retention counts and per-game overrides.
///
/// Long-lived for the process duration. Mutated only through
/// [`crate::config::PolicyStore`], which applies edits copy-modify-swap so
/// concurrent backups never observe a half-written policy.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GlobalPolicy {
    /// Path or name of the save locator executable
    #[serde(default = "default_locator_path")]
    pub locator_path: String,

    /// Path or name of the snapshotter executable
    #[serde(default = "default_snapshotter_path")]
    pub snapshotter_path: String,

    /// Repository location, passed to the snapshotter via its environment
    pub repository: String,

    /// Repository credential, passed via the environment (never argv)
    pub password: String,

    /// Optional rclone config passthrough for remote repositories
    #[serde(default)]
    pub rclone_config: Option<PathBuf>,
    #[serde(default)]
    pub rclone_config_password: Option<String>,

    /// Tag-based include/exclude gating for library games
    #[serde(default)]
    pub mode: ExecutionMode,

    /// Trigger flags
    #[serde(default = "default_true")]
    pub backup_on_stop: bool,
    #[serde(default)]
    pub backup_during_play: bool,
    #[serde(default = "default_gameplay_interval")]
    pub gameplay_interval_minutes: u32,
    #[serde(default)]
    pub backup_on_uninstall: bool,

    /// When enabled, each snapshot carries a trigger-specific tag in
    /// addition to the game-name tag
    #[serde(default = "default_true")]
    pub additional_tagging: bool,
    #[serde(default = "default_manual_tag")]
    pub manual_tag: String,
    #[serde(default = "default_stop_tag")]
    pub stop_tag: String,
    #[serde(default = "default_gameplay_tag")]
    pub gameplay_tag: String,

    #[serde(default)]
    pub retention: RetentionPolicy,

    /// Per-game overrides, keyed by a stable game identifier
    #[serde(default)]
    pub overrides: HashMap<String, GameOverride>,
}

impl GlobalPolicy {
    /// Whether a game with the given library tags participates in backups
    /// under the configured execution mode.
    pub fn game_allowed(&self, game_tags: &[String]) -> bool {
        let has = |tag: &str| game_tags.iter().any(|t| t.eq_ignore_ascii_case(tag));
        match &self.mode {
            ExecutionMode::Exclude { tag } => !has(tag),
            ExecutionMode::Include { tag } => has(tag),
        }
    }

    /// Trigger tag literal for a trigger kind, or None when additional
    /// tagging is disabled.
    pub fn trigger_tag(&self, trigger: TriggerKind) -> Option<&str> {
        if !self.additional_tagging {
            return None;
        }
        match trigger {
            TriggerKind::Manual => Some(&self.manual_tag),
            TriggerKind::GameStopped => Some(&self.stop_tag),
            TriggerKind::Gameplay => Some(&self.gameplay_tag),
            // Uninstall backups are one-offs; the stop tag doubles for them
            TriggerKind::Uninstall => Some(&self.stop_tag),
        }
    }
}

/// The closed set of events that can produce a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Manual,
    GameStopped,
    Gameplay,
    Uninstall,
}

/// Tag-based gating: either back up everything except games carrying `tag`,
/// or only games carrying `tag`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ExecutionMode {
    Exclude {
        #[serde(default = "default_exclude_tag")]
        tag: String,
    },
    Include {
        #[serde(default = "default_include_tag")]
        tag: String,
    },
}

impl Default for ExecutionMode {
    fn default() -> Self {
        ExecutionMode::Exclude {
            tag: default_exclude_tag(),
        }
    }
}

/// Snapshot retention horizons. A count of 0 means "keep none of this
/// granularity"; the corresponding flag is still emitted to the snapshotter.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub keep_last: u32,
    pub keep_daily: u32,
    pub keep_weekly: u32,
    pub keep_monthly: u32,
    pub keep_yearly: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_last: 5,
            keep_daily: 7,
            keep_weekly: 4,
            keep_monthly: 6,
            keep_yearly: 0,
        }
    }
}

/// Per-game override record. Every field is nullable; unset means "inherit
/// the global policy" — except retention, where once `use_custom_retention`
/// is set, unset counts resolve to 0 so the override fully replaces the
/// global policy for that game.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GameOverride {
    /// Display name, kept alongside the stable-id map key
    pub game_name: Option<String>,

    /// Master switch; when false the whole record is ignored
    pub override_global_settings: bool,

    pub backup_on_stop: Option<bool>,
    pub backup_during_play: Option<bool>,
    pub gameplay_interval_minutes: Option<u32>,
    pub backup_on_uninstall: Option<bool>,

    pub use_custom_retention: Option<bool>,
    pub keep_last: Option<u32>,
    pub keep_daily: Option<u32>,
    pub keep_weekly: Option<u32>,
    pub keep_monthly: Option<u32>,
    pub keep_yearly: Option<u32>,

    /// Extra tags applied to every snapshot of this game
    pub custom_tags: Vec<String>,
}

impl GameOverride {
    pub fn has_retention_override(&self) -> bool {
        self.use_custom_retention == Some(true)
    }
}

/// The fully-resolved, non-nullable policy used for one operation.
/// Computed fresh per invocation and never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectivePolicy {
    pub backup_on_stop: bool,
    pub backup_during_play: bool,
    pub gameplay_interval_minutes: u32,
    pub backup_on_uninstall: bool,
    pub retention: RetentionPolicy,
    pub extra_tags: Vec<String>,
}

impl EffectivePolicy {
    /// Resolution result when no override applies: every field inherits
    /// from the global policy.
    pub fn from_global(global: &GlobalPolicy) -> Self {
        Self {
            backup_on_stop: global.backup_on_stop,
            backup_during_play: global.backup_during_play,
            gameplay_interval_minutes: global.gameplay_interval_minutes,
            backup_on_uninstall: global.backup_on_uninstall,
            retention: global.retention.clone(),
            extra_tags: Vec::new(),
        }
    }

    pub fn trigger_enabled(&self, trigger: TriggerKind) -> bool {
        match trigger {
            TriggerKind::Manual => true,
            TriggerKind::GameStopped => self.backup_on_stop,
            TriggerKind::Gameplay => self.backup_during_play,
            TriggerKind::Uninstall => self.backup_on_uninstall,
        }
    }
}

/// Notification sink configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Webhook URL for outbound notifications; empty means console only
    pub webhook_url: String,
    pub level: NotificationLevel,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            level: NotificationLevel::Summary,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    ErrorsOnly,
    Summary,
    Verbose,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Directory for rolling log files; unset disables file logging
    pub directory: Option<PathBuf>,
    pub level: Option<String>,
    /// Rotated log files to keep
    pub max_files: u32,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            directory: None,
            level: None,
            max_files: 10,
        }
    }
}

// Default value functions

fn default_locator_path() -> String { "ludusavi".to_string() }
fn default_snapshotter_path() -> String { "restic".to_string() }
fn default_gameplay_interval() -> u32 { 15 }
fn default_manual_tag() -> String { "manual".to_string() }
fn default_stop_tag() -> String { "stop".to_string() }
fn default_gameplay_tag() -> String { "gameplay".to_string() }
fn default_exclude_tag() -> String { "no-backup".to_string() }
fn default_include_tag() -> String { "backup".to_string() }
fn default_true() -> bool { true }

#[cfg(test)]
pub(crate) fn test_policy() -> GlobalPolicy {
    GlobalPolicy {
        locator_path: "ludusavi".to_string(),
        snapshotter_path: "restic".to_string(),
        repository: "/tmp/repo".to_string(),
        password: "secret".to_string(),
        rclone_config: None,
        rclone_config_password: None,
        mode: ExecutionMode::default(),
        backup_on_stop: true,
        backup_during_play: false,
        gameplay_interval_minutes: 15,
        backup_on_uninstall: false,
        additional_tagging: true,
        manual_tag: "manual".to_string(),
        stop_tag: "stop".to_string(),
        gameplay_tag: "gameplay".to_string(),
        retention: RetentionPolicy::default(),
        overrides: HashMap::new(),
    }
}
