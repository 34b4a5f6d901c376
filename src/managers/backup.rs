//! Backup orchestration.
//!
//! One manager instance owns the policy store, the serialization gate and
//! the notifier, and spawns each operation as a task. Policy checks run
//! before the gate so filtered-out requests never queue; the subprocess
//! work runs on the blocking pool with the gate permit held end to end.

use crate::config::{
    merge_extra_tags, resolve, GlobalPolicy, PolicyStore, TriggerKind,
};
use crate::managers::notification::{NotificationSink, Severity};
use crate::utils::executor::CommandExecutor;
use crate::utils::gate::BackupGate;
use crate::utils::locator::{DiscoveryError, SaveLocator};
use crate::utils::prune_parser::PruneResult;
use crate::utils::restic::{ResticEnv, RetentionEngine, SnapshotOutcome, SnapshotWriter};
use crate::utils::tags::{build_tags, sanitize_tag};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A library game as seen by the caller: stable id, display name and the
/// library tags used for include/exclude gating.
#[derive(Debug, Clone, Default)]
pub struct GameRef {
    pub id: String,
    pub name: String,
    pub tags: Vec<String>,
}

/// Result of a bulk backup sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub partial: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: bool,
}

struct EngineInner {
    store: PolicyStore,
    gate: BackupGate,
    executor: Arc<dyn CommandExecutor>,
    notifier: Arc<dyn NotificationSink>,
}

impl EngineInner {
    fn locator(&self, policy: &GlobalPolicy) -> SaveLocator {
        SaveLocator::new(self.executor.clone(), &policy.locator_path)
    }

    fn writer(&self, policy: &GlobalPolicy) -> SnapshotWriter {
        SnapshotWriter::new(
            self.executor.clone(),
            self.notifier.clone(),
            &policy.snapshotter_path,
            ResticEnv::from_policy(policy),
        )
    }

    fn retention(&self, policy: &GlobalPolicy) -> RetentionEngine {
        RetentionEngine::new(
            self.executor.clone(),
            &policy.snapshotter_path,
            ResticEnv::from_policy(policy),
        )
    }

    /// Discover and snapshot one game. Assumes policy checks passed and the
    /// gate is held by the caller.
    fn snapshot_game(
        &self,
        policy: &GlobalPolicy,
        game_name: &str,
        trigger: TriggerKind,
        tags_extra: &[String],
    ) -> SnapshotOutcome {
        let saves = match self.locator(policy).discover_one(game_name) {
            Ok(saves) => saves,
            Err(e @ DiscoveryError::Ambiguous { .. }) => {
                warn!("{}", e);
                self.notifier.notify(
                    &format!("snapshot/{}", game_name),
                    &e.to_string(),
                    Severity::Error,
                );
                return SnapshotOutcome::Skipped;
            }
            Err(e) => {
                error!("Save discovery failed for {}: {}", game_name, e);
                self.notifier.notify(
                    &format!("snapshot/{}", game_name),
                    &format!("Backup of {} failed: {}", game_name, e),
                    Severity::Error,
                );
                return SnapshotOutcome::Error;
            }
        };

        if saves.files.is_empty() {
            info!("No save files found for {}", game_name);
            self.notifier.notify(
                &format!("snapshot/{}", game_name),
                &format!("No save files found for {}", game_name),
                Severity::Warning,
            );
            return SnapshotOutcome::Skipped;
        }

        let tags = build_tags(game_name, policy.trigger_tag(trigger), tags_extra);
        self.writer(policy)
            .create_snapshot(game_name, &saves.files, &tags)
    }

    /// Run the retention passes. With no custom-retention overrides this is
    /// a single repository-wide forget grouped by tags. As soon as any game
    /// carries custom retention, the run switches to one tag-scoped pass per
    /// game: a repository-wide pass would clip games whose custom policy is
    /// looser than the global counts.
    fn retention_passes(&self, policy: &GlobalPolicy, dry_run: bool) -> PruneResult {
        let engine = self.retention(policy);

        let mut has_custom = false;
        for (game_id, ovr) in &policy.overrides {
            if !ovr.has_retention_override() || !ovr.override_global_settings {
                continue;
            }
            if ovr.game_name.is_none() {
                warn!("Override {} has custom retention but no game name", game_id);
                continue;
            }
            has_custom = true;
        }
        if !has_custom {
            return engine.apply_retention(&policy.retention, dry_run);
        }

        let snapshots = match engine.list_snapshots(None) {
            Ok(snapshots) => snapshots,
            Err(e) => {
                error!("Could not enumerate snapshots for retention: {}", e);
                return PruneResult::invocation_failure(&e.to_string(), dry_run);
            }
        };

        let mut games: Vec<String> = Vec::new();
        for snap in &snapshots {
            if let Some(name) = snap.game_name() {
                if !games.iter().any(|g| g == name) {
                    games.push(name.to_string());
                }
            }
        }

        let mut combined = PruneResult::clean(dry_run);
        for game in &games {
            // Snapshot tags carry the sanitized name, overrides the raw one
            let ovr = policy.overrides.values().find(|o| {
                o.game_name
                    .as_deref()
                    .is_some_and(|n| sanitize_tag(n) == *game)
            });
            let effective = resolve(policy, ovr);
            combined.absorb(engine.apply_retention_for_game(
                game,
                &effective.retention,
                dry_run,
            ));
        }
        combined
    }
}

/// Entry point for all backup and retention operations.
#[derive(Clone)]
pub struct BackupManager {
    inner: Arc<EngineInner>,
}

impl BackupManager {
    pub fn new(
        policy: GlobalPolicy,
        executor: Arc<dyn CommandExecutor>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store: PolicyStore::new(policy),
                gate: BackupGate::new(),
                executor,
                notifier,
            }),
        }
    }

    pub fn store(&self) -> &PolicyStore {
        &self.inner.store
    }

    /// Back up one game. Returns immediately; the snapshot runs behind the
    /// gate on the blocking pool.
    ///
    /// Disabled triggers and excluded games resolve to `Skipped` without
    /// queueing for the gate.
    pub fn backup_game(
        &self,
        game: GameRef,
        trigger: TriggerKind,
        extra_tags: Vec<String>,
    ) -> JoinHandle<SnapshotOutcome> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let policy = inner.store.snapshot();
            let effective = resolve(&policy, policy.overrides.get(&game.id));

            if !effective.trigger_enabled(trigger) {
                debug!("Trigger disabled for {}, skipping", game.name);
                return SnapshotOutcome::Skipped;
            }
            if !policy.game_allowed(&game.tags) {
                debug!("{} is excluded by the execution mode, skipping", game.name);
                return SnapshotOutcome::Skipped;
            }

            let tags_extra = merge_extra_tags(&effective.extra_tags, &extra_tags);
            let permit = inner.gate.acquire().await;
            let result = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                inner.snapshot_game(&policy, &game.name, trigger, &tags_extra)
            })
            .await;

            result.unwrap_or_else(|e| {
                error!("Backup task panicked: {}", e);
                SnapshotOutcome::Error
            })
        })
    }

    /// Back up every game the locator knows about, holding the gate for the
    /// whole sweep. `cancel` is checked between games, so a cancelled sweep
    /// finishes the in-flight snapshot and stops.
    pub fn backup_all(
        &self,
        extra_tags: Vec<String>,
        cancel: Arc<AtomicBool>,
    ) -> JoinHandle<BulkSummary> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let policy = inner.store.snapshot();
            let permit = inner.gate.acquire().await;

            let result = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                inner.sweep(&policy, &extra_tags, &cancel)
            })
            .await;

            result.unwrap_or_else(|e| {
                error!("Bulk backup task panicked: {}", e);
                BulkSummary::default()
            })
        })
    }

    /// Apply retention behind the gate. Games with custom retention are
    /// governed only by their own counts, never by the global policy.
    pub fn run_retention(&self, dry_run: bool) -> JoinHandle<PruneResult> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let policy = inner.store.snapshot();
            let permit = inner.gate.acquire().await;

            let result = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let combined = inner.retention_passes(&policy, dry_run);

                let severity = if combined.success {
                    Severity::Info
                } else {
                    Severity::Error
                };
                inner.notifier.notify(
                    "retention",
                    &format!(
                        "Retention {}: {} snapshots across {} games{}",
                        if combined.success { "complete" } else { "failed" },
                        combined.snapshots_deleted,
                        combined.games_affected,
                        if dry_run { " (dry run)" } else { "" },
                    ),
                    severity,
                );
                combined
            })
            .await;

            result.unwrap_or_else(|e| {
                error!("Retention task panicked: {}", e);
                PruneResult::invocation_failure(&e.to_string(), dry_run)
            })
        })
    }
}

impl EngineInner {
    fn sweep(
        &self,
        policy: &GlobalPolicy,
        extra_tags: &[String],
        cancel: &AtomicBool,
    ) -> BulkSummary {
        let mut summary = BulkSummary::default();

        let all = match self.locator(policy).discover_all() {
            Ok(all) => all,
            Err(e) => {
                error!("Bulk discovery failed: {}", e);
                self.notifier.notify(
                    "backup-all",
                    &format!("Bulk backup failed: {}", e),
                    Severity::Error,
                );
                return summary;
            }
        };

        for saves in all {
            if cancel.load(Ordering::SeqCst) {
                info!("Bulk backup cancelled after {} games", summary.attempted);
                summary.cancelled = true;
                break;
            }
            summary.attempted += 1;

            // Bulk sweeps carry no library context; overrides match on the
            // recorded game name instead of the library id.
            let ovr = policy
                .overrides
                .values()
                .find(|o| o.game_name.as_deref() == Some(saves.game_name.as_str()));
            let effective = resolve(policy, ovr);
            if saves.files.is_empty() {
                summary.skipped += 1;
                continue;
            }

            let tags_extra = merge_extra_tags(&effective.extra_tags, extra_tags);
            let tags = build_tags(
                &saves.game_name,
                policy.trigger_tag(TriggerKind::Manual),
                &tags_extra,
            );
            match self
                .writer(policy)
                .create_snapshot(&saves.game_name, &saves.files, &tags)
            {
                SnapshotOutcome::Success => summary.succeeded += 1,
                SnapshotOutcome::PartialFailure => summary.partial += 1,
                SnapshotOutcome::Failure | SnapshotOutcome::Error => summary.failed += 1,
                SnapshotOutcome::Skipped => summary.skipped += 1,
            }
        }

        let severity = if summary.failed > 0 {
            Severity::Warning
        } else {
            Severity::Info
        };
        self.notifier.notify(
            "backup-all",
            &format!(
                "Bulk backup{}: {} ok, {} partial, {} failed, {} skipped",
                if summary.cancelled { " (cancelled)" } else { "" },
                summary.succeeded,
                summary.partial,
                summary.failed,
                summary.skipped,
            ),
            severity,
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionMode, GameOverride};
    use crate::managers::notification::mock::MemoryNotifier;
    use crate::utils::executor::mock::{MockExecutor, MockResponse};
    use std::collections::HashMap;

    fn test_policy() -> GlobalPolicy {
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
            retention: Default::default(),
            overrides: HashMap::new(),
        }
    }

    fn single_game_report(name: &str) -> String {
        format!(
            r#"{{"overall": {{"totalGames": 1}},
                "games": {{"{}": {{"files": [{{"path": "/saves/slot1.dat"}}]}}}}}}"#,
            name
        )
    }

    fn manager(
        policy: GlobalPolicy,
        executor: MockExecutor,
    ) -> (BackupManager, Arc<MemoryNotifier>) {
        let notifier = Arc::new(MemoryNotifier::new());
        (
            BackupManager::new(policy, Arc::new(executor), notifier.clone()),
            notifier,
        )
    }

    fn game(name: &str) -> GameRef {
        GameRef {
            id: format!("id-{}", name),
            name: name.to_string(),
            tags: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_backup_game_success() {
        let executor = MockExecutor::new()
            .expect("ludusavi", MockResponse::ok(&single_game_report("Celeste")))
            .expect("restic", MockResponse::ok(""));
        let (manager, _) = manager(test_policy(), executor.clone());

        let outcome = manager
            .backup_game(game("Celeste"), TriggerKind::Manual, Vec::new())
            .await
            .unwrap();

        assert_eq!(outcome, SnapshotOutcome::Success);
        let restic_call = executor
            .get_calls()
            .into_iter()
            .find(|c| c.program == "restic")
            .unwrap();
        assert_eq!(&restic_call.args[..5], &["backup", "--tag", "Celeste", "--tag", "manual"]);
    }

    #[tokio::test]
    async fn test_backup_game_disabled_trigger_skips_without_commands() {
        let executor = MockExecutor::new();
        let (manager, notifier) = manager(test_policy(), executor.clone());

        // backup_during_play is off in the test policy
        let outcome = manager
            .backup_game(game("Celeste"), TriggerKind::Gameplay, Vec::new())
            .await
            .unwrap();

        assert_eq!(outcome, SnapshotOutcome::Skipped);
        assert!(executor.get_calls().is_empty());
        assert_eq!(notifier.count(), 0);
    }

    #[tokio::test]
    async fn test_backup_game_excluded_by_mode_skips() {
        let executor = MockExecutor::new();
        let (manager, _) = manager(test_policy(), executor.clone());

        let mut game = game("Celeste");
        game.tags.push("no-backup".to_string());
        let outcome = manager
            .backup_game(game, TriggerKind::Manual, Vec::new())
            .await
            .unwrap();

        assert_eq!(outcome, SnapshotOutcome::Skipped);
        assert!(executor.get_calls().is_empty());
    }

    #[tokio::test]
    async fn test_backup_game_empty_save_set_notifies_and_skips() {
        let report = r#"{"overall": {"totalGames": 1},
                         "games": {"Celeste": {"files": []}}}"#;
        let executor = MockExecutor::new().expect("ludusavi", MockResponse::ok(report));
        let (manager, notifier) = manager(test_policy(), executor.clone());

        let outcome = manager
            .backup_game(game("Celeste"), TriggerKind::Manual, Vec::new())
            .await
            .unwrap();

        assert_eq!(outcome, SnapshotOutcome::Skipped);
        assert_eq!(executor.call_count("restic"), 0);
        assert_eq!(notifier.count(), 1);
        assert!(notifier.sent()[0].message.contains("No save files"));
    }

    #[tokio::test]
    async fn test_backup_game_ambiguous_lookup_notifies_error() {
        let report = r#"{"overall": {"totalGames": 3}, "games": {}}"#;
        let executor = MockExecutor::new().expect("ludusavi", MockResponse::ok(report));
        let (manager, notifier) = manager(test_policy(), executor.clone());

        let outcome = manager
            .backup_game(game("Celeste"), TriggerKind::Manual, Vec::new())
            .await
            .unwrap();

        assert_eq!(outcome, SnapshotOutcome::Skipped);
        assert_eq!(executor.call_count("restic"), 0);
        assert_eq!(notifier.last_severity(), Some(Severity::Error));
    }

    #[tokio::test]
    async fn test_backup_game_override_adds_custom_tags() {
        let mut policy = test_policy();
        policy.overrides.insert(
            "id-Celeste".to_string(),
            GameOverride {
                override_global_settings: true,
                custom_tags: vec!["speedrun".to_string()],
                ..Default::default()
            },
        );
        let executor = MockExecutor::new()
            .expect("ludusavi", MockResponse::ok(&single_game_report("Celeste")))
            .expect("restic", MockResponse::ok(""));
        let (manager, _) = manager(policy, executor.clone());

        manager
            .backup_game(game("Celeste"), TriggerKind::GameStopped, Vec::new())
            .await
            .unwrap();

        let restic_call = executor
            .get_calls()
            .into_iter()
            .find(|c| c.program == "restic")
            .unwrap();
        assert_eq!(
            &restic_call.args[..7],
            &["backup", "--tag", "Celeste", "--tag", "stop", "--tag", "speedrun"]
        );
    }

    #[tokio::test]
    async fn test_backup_all_summarizes_sweep() {
        let report = r#"{
            "overall": {"totalGames": 2},
            "games": {
                "Celeste": {"files": [{"path": "/saves/a.dat"}]},
                "Hades": {"files": []}
            }
        }"#;
        let executor = MockExecutor::new()
            .expect("ludusavi", MockResponse::ok(report))
            .expect("restic", MockResponse::ok(""));
        let (manager, notifier) = manager(test_policy(), executor.clone());

        let summary = manager
            .backup_all(Vec::new(), Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();

        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.skipped, 1);
        assert!(!summary.cancelled);
        assert_eq!(executor.call_count("restic"), 1);
        // Writer notification for Celeste plus the sweep summary
        assert_eq!(notifier.sent().last().unwrap().id, "backup-all");
    }

    #[tokio::test]
    async fn test_backup_all_cancelled_before_start() {
        let report = r#"{
            "overall": {"totalGames": 1},
            "games": {"Celeste": {"files": [{"path": "/saves/a.dat"}]}}
        }"#;
        let executor = MockExecutor::new()
            .expect("ludusavi", MockResponse::ok(report))
            .expect("restic", MockResponse::ok(""));
        let (manager, _) = manager(test_policy(), executor.clone());

        let summary = manager
            .backup_all(Vec::new(), Arc::new(AtomicBool::new(true)))
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.attempted, 0);
        assert_eq!(executor.call_count("restic"), 0);
    }

    #[tokio::test]
    async fn test_run_retention_without_overrides_runs_single_global_pass() {
        let executor = MockExecutor::new().expect("restic", MockResponse::ok("[]"));
        let (manager, notifier) = manager(test_policy(), executor.clone());

        let result = manager.run_retention(true).await.unwrap();

        assert!(result.success);
        assert!(result.is_dry_run);
        assert_eq!(executor.call_count("restic"), 1);

        let calls = executor.get_calls();
        assert_eq!(calls[0].args[0], "forget");
        assert!(!calls[0].args.contains(&"--tag".to_string()));
        assert_eq!(notifier.sent().last().unwrap().id, "retention");
    }

    #[tokio::test]
    async fn test_run_retention_custom_retention_scopes_every_pass_by_tag() {
        let mut policy = test_policy();
        policy.overrides.insert(
            "id-1".to_string(),
            GameOverride {
                game_name: Some("Hades".to_string()),
                override_global_settings: true,
                use_custom_retention: Some(true),
                keep_last: Some(100),
                ..Default::default()
            },
        );
        let listing = r#"[
            {"id": "aaaa000011112222", "time": "2026-02-01T10:00:00Z",
             "tags": ["Celeste", "manual"]},
            {"id": "bbbb000011112222", "time": "2026-01-01T10:00:00Z",
             "tags": ["Hades", "stop"]}
        ]"#;
        let executor = MockExecutor::new()
            .expect("restic", MockResponse::ok("[]"))
            .expect_next("restic", MockResponse::ok(listing));
        let (manager, notifier) = manager(policy, executor.clone());

        let result = manager.run_retention(true).await.unwrap();

        assert!(result.success);
        assert_eq!(executor.call_count("restic"), 3);

        let calls = executor.get_calls();
        assert_eq!(&calls[0].args[..2], &["snapshots", "--json"]);

        // One tag-scoped pass per game and no repository-wide forget, so a
        // looser custom policy is never clipped by the global counts
        for call in &calls[1..] {
            assert_eq!(&call.args[..2], &["forget", "--tag"]);
        }
        let celeste = &calls[1].args;
        assert_eq!(celeste[2], "Celeste");
        let keep_last_at = celeste.iter().position(|a| a == "--keep-last").unwrap();
        assert_eq!(celeste[keep_last_at + 1], "5");

        let hades = &calls[2].args;
        assert_eq!(hades[2], "Hades");
        let keep_last_at = hades.iter().position(|a| a == "--keep-last").unwrap();
        assert_eq!(hades[keep_last_at + 1], "100");
        // Custom retention zero-fills unset horizons
        let keep_daily_at = hades.iter().position(|a| a == "--keep-daily").unwrap();
        assert_eq!(hades[keep_daily_at + 1], "0");

        assert_eq!(notifier.sent().last().unwrap().id, "retention");
    }

    #[tokio::test]
    async fn test_run_retention_fails_when_listing_is_unavailable() {
        let mut policy = test_policy();
        policy.overrides.insert(
            "id-1".to_string(),
            GameOverride {
                game_name: Some("Hades".to_string()),
                override_global_settings: true,
                use_custom_retention: Some(true),
                keep_last: Some(2),
                ..Default::default()
            },
        );
        let executor = MockExecutor::new()
            .expect("restic", MockResponse::StartFailure("no such file".to_string()));
        let (manager, _) = manager(policy, executor.clone());

        let result = manager.run_retention(false).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.snapshots_deleted, 0);
        // No forget was attempted without the game listing
        assert_eq!(executor.call_count("restic"), 1);
    }
}
