//! Snapshotter invocation: snapshot creation, retention runs, repository
//! maintenance and snapshot listing.
//!
//! Credentials travel exclusively through the child environment, never
//! argv, so they cannot leak into process listings or logs.

use crate::config::RetentionPolicy;
use crate::managers::notification::{NotificationSink, Severity};
use crate::utils::executor::{CommandExecutor, CommandOutput};
use crate::utils::prune_parser::{parse_forget, PruneResult};
use crate::utils::tags::sanitize_tag;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

/// Environment handed to every snapshotter invocation.
#[derive(Debug, Clone)]
pub struct ResticEnv {
    pub repository: String,
    pub password: String,
    pub rclone_config: Option<PathBuf>,
    pub rclone_config_password: Option<String>,
}

impl ResticEnv {
    pub fn from_policy(policy: &crate::config::GlobalPolicy) -> Self {
        Self {
            repository: policy.repository.clone(),
            password: policy.password.clone(),
            rclone_config: policy.rclone_config.clone(),
            rclone_config_password: policy.rclone_config_password.clone(),
        }
    }

    fn as_map(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("RESTIC_REPOSITORY".to_string(), self.repository.clone());
        env.insert("RESTIC_PASSWORD".to_string(), self.password.clone());
        if let Some(path) = &self.rclone_config {
            env.insert(
                "RCLONE_CONFIG".to_string(),
                path.to_string_lossy().into_owned(),
            );
        }
        if let Some(password) = &self.rclone_config_password {
            env.insert("RCLONE_CONFIG_PASS".to_string(), password.clone());
        }
        env
    }
}

/// Terminal classification of one snapshot attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// Snapshot created
    Success,
    /// Snapshot created, but some files could not be read (exit code 3)
    PartialFailure,
    /// The snapshotter ran and reported failure (exit code 1)
    Failure,
    /// The snapshotter could not be run at all
    Error,
    /// Nothing to do: empty file set or policy filtered the game out
    Skipped,
}

impl SnapshotOutcome {
    pub fn is_snapshot_created(self) -> bool {
        matches!(self, SnapshotOutcome::Success | SnapshotOutcome::PartialFailure)
    }
}

/// One snapshot in the repository, as reported by `snapshots --json`.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotInfo {
    pub id: String,
    #[serde(default)]
    pub short_id: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
}

impl SnapshotInfo {
    /// The game-name tag is always written first, so the first tag names
    /// the game the snapshot belongs to.
    pub fn game_name(&self) -> Option<&str> {
        self.tags.first().map(String::as_str)
    }
}

/// Creates snapshots from discovered file sets.
pub struct SnapshotWriter {
    executor: Arc<dyn CommandExecutor>,
    notifier: Arc<dyn NotificationSink>,
    program: String,
    env: ResticEnv,
}

impl SnapshotWriter {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        notifier: Arc<dyn NotificationSink>,
        program: &str,
        env: ResticEnv,
    ) -> Self {
        Self {
            executor,
            notifier,
            program: program.to_string(),
            env,
        }
    }

    /// Snapshot the given files under the given tags. Emits exactly one
    /// notification describing the outcome, except for the empty-set no-op.
    ///
    /// The file list is handed over through a scratch file read verbatim by
    /// the snapshotter, so paths with spaces and unicode survive intact. The
    /// scratch file is removed once a snapshot exists and kept for
    /// inspection when the run fails.
    pub fn create_snapshot(
        &self,
        game_name: &str,
        files: &[String],
        tags: &[String],
    ) -> SnapshotOutcome {
        if files.is_empty() {
            debug!("No files to snapshot for {}, skipping", game_name);
            return SnapshotOutcome::Skipped;
        }

        let notify_id = format!("snapshot/{}", game_name);
        let scratch = match write_scratch_file(game_name, files) {
            Ok(path) => path,
            Err(e) => {
                error!("Failed to stage file list for {}: {}", game_name, e);
                self.notifier.notify(
                    &notify_id,
                    &format!("Backup of {} failed: {}", game_name, e),
                    Severity::Error,
                );
                return SnapshotOutcome::Error;
            }
        };

        let mut args = vec!["backup".to_string()];
        for tag in tags {
            args.push("--tag".to_string());
            args.push(tag.clone());
        }
        args.push("--files-from-verbatim".to_string());
        args.push(scratch.to_string_lossy().into_owned());

        let outcome = match self.executor.execute(&self.program, &args, &self.env.as_map()) {
            Ok(output) => classify_backup_exit(&output),
            Err(e) => {
                error!("Snapshotter could not be run for {}: {}", game_name, e);
                self.notifier.notify(
                    &notify_id,
                    &format!("Backup of {} failed: {}", game_name, e),
                    Severity::Error,
                );
                return SnapshotOutcome::Error;
            }
        };

        match outcome {
            SnapshotOutcome::Success => {
                info!("Backed up {} files for {}", files.len(), game_name);
                remove_scratch_file(&scratch);
                self.notifier.notify(
                    &notify_id,
                    &format!("Backed up {} ({} files)", game_name, files.len()),
                    Severity::Info,
                );
            }
            SnapshotOutcome::PartialFailure => {
                warn!("Snapshot for {} completed with unreadable files", game_name);
                remove_scratch_file(&scratch);
                self.notifier.notify(
                    &notify_id,
                    &format!(
                        "Backed up {} with warnings: some files could not be read",
                        game_name
                    ),
                    Severity::Warning,
                );
            }
            SnapshotOutcome::Failure => {
                error!("Snapshot for {} failed", game_name);
                self.notifier.notify(
                    &notify_id,
                    &format!("Backup of {} failed", game_name),
                    Severity::Error,
                );
            }
            // classify_backup_exit never yields these
            SnapshotOutcome::Error | SnapshotOutcome::Skipped => {}
        }
        outcome
    }
}

fn classify_backup_exit(output: &CommandOutput) -> SnapshotOutcome {
    match output.exit_code {
        1 => SnapshotOutcome::Failure,
        3 => SnapshotOutcome::PartialFailure,
        _ => SnapshotOutcome::Success,
    }
}

/// Stage the file list in a uniquely-named scratch file. `create_new`
/// guards against colliding with a concurrent run.
fn write_scratch_file(game_name: &str, files: &[String]) -> std::io::Result<PathBuf> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let path = std::env::temp_dir().join(format!(
        "saveguard-{}-{}.list",
        sanitize_tag(game_name).replace(['/', '\\', ':'], "_"),
        nanos
    ));

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)?;
    for raw in files {
        writeln!(file, "{}", normalize_path(raw))?;
    }
    Ok(path)
}

fn remove_scratch_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!("Failed to remove scratch file {}: {}", path.display(), e);
    }
}

/// Canonicalize locator-reported paths for the snapshotter.
///
/// Extended-length prefixes (`\\?\` and `\\?\UNC\`) are stripped, and
/// forward slashes are rewritten to backslashes for drive-letter and UNC
/// paths. Non-Windows paths pass through untouched.
pub fn normalize_path(raw: &str) -> String {
    let mut path = raw.to_string();
    if let Some(rest) = path.strip_prefix(r"\\?\UNC\") {
        path = format!(r"\\{}", rest);
    } else if let Some(rest) = path.strip_prefix(r"\\?\") {
        path = rest.to_string();
    }

    let is_drive_path = path
        .as_bytes()
        .first()
        .is_some_and(|b| b.is_ascii_alphabetic())
        && path.as_bytes().get(1) == Some(&b':');
    if is_drive_path || path.starts_with(r"\\") {
        path = path.replace('/', r"\");
    }
    path
}

/// Applies retention policies and performs repository maintenance.
pub struct RetentionEngine {
    executor: Arc<dyn CommandExecutor>,
    program: String,
    env: ResticEnv,
}

impl RetentionEngine {
    pub fn new(executor: Arc<dyn CommandExecutor>, program: &str, env: ResticEnv) -> Self {
        Self {
            executor,
            program: program.to_string(),
            env,
        }
    }

    /// Apply the retention policy across the repository, grouped by tags so
    /// each game's snapshot history is pruned independently.
    ///
    /// A dry run previews removals; otherwise data is pruned in the same
    /// pass. The result always carries the raw tool output.
    pub fn apply_retention(&self, retention: &RetentionPolicy, dry_run: bool) -> PruneResult {
        let args = build_retention_args(retention, dry_run);
        info!(
            "Applying retention ({})",
            if dry_run { "dry run" } else { "prune" }
        );

        match self.executor.execute(&self.program, &args, &self.env.as_map()) {
            Ok(output) => parse_forget(&output, dry_run),
            Err(e) => {
                error!("Retention run could not start: {}", e);
                PruneResult::invocation_failure(&e.to_string(), dry_run)
            }
        }
    }

    /// Apply a game-specific retention policy to that game's snapshots
    /// only. Used for games whose override carries custom retention.
    pub fn apply_retention_for_game(
        &self,
        game_name: &str,
        retention: &RetentionPolicy,
        dry_run: bool,
    ) -> PruneResult {
        let mut args = build_retention_args(retention, dry_run);
        args.insert(1, sanitize_tag(game_name));
        args.insert(1, "--tag".to_string());
        info!("Applying custom retention for {}", game_name);

        match self.executor.execute(&self.program, &args, &self.env.as_map()) {
            Ok(output) => parse_forget(&output, dry_run),
            Err(e) => {
                error!("Retention run for {} could not start: {}", game_name, e);
                PruneResult::invocation_failure(&e.to_string(), dry_run)
            }
        }
    }

    /// List repository snapshots, newest first, optionally restricted to
    /// one game's tag.
    pub fn list_snapshots(&self, game_name: Option<&str>) -> anyhow::Result<Vec<SnapshotInfo>> {
        let mut args = vec!["snapshots".to_string(), "--json".to_string()];
        if let Some(name) = game_name {
            args.push("--tag".to_string());
            args.push(sanitize_tag(name));
        }

        let output = self.executor.execute(&self.program, &args, &self.env.as_map())?;
        if !output.success() {
            anyhow::bail!("snapshot listing failed: {}", output.stderr.trim());
        }

        let mut snapshots: Vec<SnapshotInfo> = serde_json::from_str(&output.stdout)?;
        snapshots.sort_by(|a, b| b.time.cmp(&a.time));
        Ok(snapshots)
    }

    /// Initialize the repository. Already-initialized is treated as success
    /// so the command is safe to re-run.
    pub fn init_repository(&self) -> anyhow::Result<()> {
        let args = vec!["init".to_string()];
        let output = self.executor.execute(&self.program, &args, &self.env.as_map())?;

        if output.success() || output.stderr.contains("already initialized") {
            info!("Repository ready at {}", self.env.repository);
            return Ok(());
        }
        anyhow::bail!("repository init failed: {}", output.stderr.trim())
    }

    /// Drop stale repository locks left behind by interrupted runs.
    pub fn unlock_repository(&self) -> anyhow::Result<()> {
        let args = vec!["unlock".to_string()];
        let output = self.executor.execute(&self.program, &args, &self.env.as_map())?;
        if !output.success() {
            anyhow::bail!("unlock failed: {}", output.stderr.trim());
        }
        Ok(())
    }
}

/// Build the forget invocation. All five horizon flags are always emitted,
/// zeros included, so a previously-configured horizon cannot silently keep
/// applying. Dry-run and prune are mutually exclusive by construction.
pub fn build_retention_args(retention: &RetentionPolicy, dry_run: bool) -> Vec<String> {
    let mut args = vec![
        "forget".to_string(),
        "--keep-last".to_string(),
        retention.keep_last.to_string(),
        "--keep-daily".to_string(),
        retention.keep_daily.to_string(),
        "--keep-weekly".to_string(),
        retention.keep_weekly.to_string(),
        "--keep-monthly".to_string(),
        retention.keep_monthly.to_string(),
        "--keep-yearly".to_string(),
        retention.keep_yearly.to_string(),
        "--group-by".to_string(),
        "tags".to_string(),
        "--json".to_string(),
    ];
    args.push(if dry_run { "--dry-run" } else { "--prune" }.to_string());
    args
}
