//! High-level managers: backup orchestration, logging setup and outcome
//! notifications.

pub mod backup;
pub mod logging;
pub mod notification;

pub use backup::{BackupManager, BulkSummary, GameRef};
pub use logging::{init_console_logging, init_logging, LogGuard};
pub use notification::{build_notifier, NotificationSink, Severity};
