mod config;
mod managers;
mod utils;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use config::TriggerKind;
use managers::backup::{BackupManager, GameRef};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use utils::executor::RealExecutor;
use utils::restic::{ResticEnv, RetentionEngine, SnapshotOutcome};

#[derive(Parser)]
#[command(name = "saveguard")]
#[command(about = "Game save backup orchestration wrapping ludusavi and restic", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TriggerArg {
    Manual,
    Stop,
    Gameplay,
    Uninstall,
}

impl From<TriggerArg> for TriggerKind {
    fn from(arg: TriggerArg) -> Self {
        match arg {
            TriggerArg::Manual => TriggerKind::Manual,
            TriggerArg::Stop => TriggerKind::GameStopped,
            TriggerArg::Gameplay => TriggerKind::Gameplay,
            TriggerArg::Uninstall => TriggerKind::Uninstall,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Back up a single game's save files
    Backup {
        /// Game name as known to the save locator
        game: String,

        /// Stable game id used for override lookup (defaults to the name)
        #[arg(long)]
        id: Option<String>,

        /// Extra tags for this snapshot (can be used multiple times)
        #[arg(short, long = "tag")]
        tags: Vec<String>,

        /// Prompt interactively for extra tags before backing up
        #[arg(long)]
        prompt_tags: bool,

        /// Which trigger this backup represents
        #[arg(long, value_enum, default_value = "manual")]
        trigger: TriggerArg,
    },

    /// Back up every game the locator knows about
    BackupAll {
        /// Extra tags applied to every snapshot (can be used multiple times)
        #[arg(short, long = "tag")]
        tags: Vec<String>,
    },

    /// Apply the retention policy across the repository
    Retention {
        /// Preview removals without pruning anything
        #[arg(long)]
        dry_run: bool,
    },

    /// List snapshots in the repository
    Snapshots {
        /// Restrict to one game's snapshots
        #[arg(short, long)]
        game: Option<String>,

        /// Emit the listing as JSON
        #[arg(long)]
        json: bool,
    },

    /// Initialize the repository (safe to re-run)
    Init,

    /// Remove stale repository locks
    Unlock,

    /// Validate the configuration file
    Validate,
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("saveguard")
        .join("config.toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);

    let config = match config::load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            managers::logging::init_console_logging();
            eprintln!("✗ Failed to load {}: {}", config_path.display(), e);
            std::process::exit(1);
        }
    };

    // Must keep the guard alive for the duration of the program
    let _log_guard = managers::logging::init_logging(&config.logging)?;

    if let Commands::Validate = cli.command {
        println!("Configuration is valid!");
        println!("Repository: {}", config.policy.repository);
        println!("Overrides: {}", config.policy.overrides.len());
        return Ok(());
    }

    let executor = Arc::new(RealExecutor::new());
    let notifier = managers::notification::build_notifier(&config.notifications);

    match cli.command {
        Commands::Backup {
            game,
            id,
            mut tags,
            prompt_tags,
            trigger,
        } => {
            // Prompt before any work so the gate is never held while the
            // user types
            if prompt_tags {
                let input: String = dialoguer::Input::new()
                    .with_prompt("Extra tags (comma separated, empty for none)")
                    .allow_empty(true)
                    .interact_text()?;
                tags.extend(
                    input
                        .split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(String::from),
                );
            }

            let manager = BackupManager::new(config.policy, executor, notifier);
            let game_ref = GameRef {
                id: id.unwrap_or_else(|| game.clone()),
                name: game.clone(),
                tags: Vec::new(),
            };

            let outcome = manager
                .backup_game(game_ref, trigger.into(), tags)
                .await?;
            match outcome {
                SnapshotOutcome::Success => println!("✓ Backed up {}", game),
                SnapshotOutcome::PartialFailure => {
                    println!("⚠ Backed up {} with warnings", game)
                }
                SnapshotOutcome::Skipped => println!("- Nothing to do for {}", game),
                SnapshotOutcome::Failure | SnapshotOutcome::Error => {
                    eprintln!("✗ Backup of {} failed", game);
                    std::process::exit(1);
                }
            }
        }

        Commands::BackupAll { tags } => {
            let manager = BackupManager::new(config.policy, executor, notifier);

            let cancel = Arc::new(AtomicBool::new(false));
            let cancel_flag = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("\nCancelling after the current game...");
                    cancel_flag.store(true, Ordering::SeqCst);
                }
            });

            let summary = manager.backup_all(tags, cancel).await?;
            println!(
                "{} {} ok, {} partial, {} failed, {} skipped",
                if summary.cancelled { "⚠ Cancelled:" } else { "✓ Done:" },
                summary.succeeded,
                summary.partial,
                summary.failed,
                summary.skipped,
            );
            if summary.failed > 0 {
                std::process::exit(1);
            }
        }

        Commands::Retention { dry_run } => {
            let manager = BackupManager::new(config.policy, executor, notifier);
            let result = manager.run_retention(dry_run).await?;

            if dry_run {
                println!("Dry run: {} snapshots would be removed", result.snapshots_deleted);
            } else {
                println!(
                    "✓ Removed {} snapshots across {} games",
                    result.snapshots_deleted, result.games_affected
                );
            }
            if let Some(figure) = &result.data_deleted {
                println!("  Data: {}", figure);
            }
            for snapshot in &result.deleted_snapshots {
                if !snapshot.short_id.is_empty() {
                    println!(
                        "  {} {}",
                        snapshot.short_id,
                        if snapshot.game_name.is_empty() {
                            "(unknown game)"
                        } else {
                            &snapshot.game_name
                        }
                    );
                }
            }
            if !result.success {
                eprintln!("✗ Retention run failed:\n{}", result.raw_output);
                std::process::exit(1);
            }
        }

        Commands::Snapshots { game, json } => {
            let engine = RetentionEngine::new(
                executor,
                &config.policy.snapshotter_path,
                ResticEnv::from_policy(&config.policy),
            );
            let snapshots =
                tokio::task::spawn_blocking(move || engine.list_snapshots(game.as_deref()))
                    .await??;

            if json {
                let listing: Vec<_> = snapshots
                    .iter()
                    .map(|s| {
                        serde_json::json!({
                            "id": s.id,
                            "short_id": s.short_id,
                            "time": s.time,
                            "hostname": s.hostname,
                            "game": s.game_name(),
                            "tags": s.tags,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&listing)?);
            } else if snapshots.is_empty() {
                println!("No snapshots found.");
            } else {
                println!("{:<10} {:<20} {:<15} Game", "ID", "Date", "Host");
                println!("{}", "-".repeat(60));
                for snapshot in &snapshots {
                    println!(
                        "{:<10} {:<20} {:<15} {}",
                        snapshot.short_id,
                        snapshot.time.format("%Y-%m-%d %H:%M:%S"),
                        snapshot.hostname,
                        snapshot.game_name().unwrap_or("-"),
                    );
                }
                println!("\nTotal: {} snapshots", snapshots.len());
            }
        }

        Commands::Init => {
            let engine = RetentionEngine::new(
                executor,
                &config.policy.snapshotter_path,
                ResticEnv::from_policy(&config.policy),
            );
            tokio::task::spawn_blocking(move || engine.init_repository()).await??;
            println!("✓ Repository initialized");
        }

        Commands::Unlock => {
            let engine = RetentionEngine::new(
                executor,
                &config.policy.snapshotter_path,
                ResticEnv::from_policy(&config.policy),
            );
            tokio::task::spawn_blocking(move || engine.unlock_repository()).await??;
            println!("✓ Repository unlocked");
        }

        Commands::Validate => unreachable!("handled before manager construction"),
    }

    Ok(())
}
