//! Shared plumbing: subprocess execution, the backup gate, tag handling and
//! the wrappers around the two external tools.

pub mod executor;
pub mod gate;
pub mod locator;
pub mod prune_parser;
pub mod restic;
pub mod tags;

pub use executor::{CommandExecutor, CommandOutput, RealExecutor};
pub use gate::{BackupGate, BackupPermit};
pub use locator::{DiscoveryError, GameSaves, SaveLocator};
pub use prune_parser::{parse_forget, DeletedSnapshot, PruneResult};
pub use restic::{
    build_retention_args, normalize_path, ResticEnv, RetentionEngine, SnapshotInfo,
    SnapshotOutcome, SnapshotWriter,
};
pub use tags::{build_tags, sanitize_tag};
