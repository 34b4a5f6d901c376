//! Saveguard Library
//!
//! Backup orchestration for game saves: discovers save files through an
//! external locator and snapshots them into a restic repository.

pub mod config;
pub mod managers;
pub mod utils;

// Re-export commonly used types
pub use config::{load_config, resolve, Config, GlobalPolicy, PolicyStore, TriggerKind};
pub use managers::backup::{BackupManager, BulkSummary, GameRef};
pub use managers::logging::{init_console_logging, init_logging, LogGuard};
pub use managers::notification::{build_notifier, NotificationSink, Severity};
pub use utils::restic::SnapshotOutcome;
