//! Save-file discovery via the external locator tool.
//!
//! The locator is invoked in API preview mode and reports, per game, the
//! set of files it would back up. Two report schemas exist in the wild:
//! older releases emit the files block as a path-keyed table, newer ones as
//! a record list. Both are accepted transparently.

use crate::utils::executor::CommandExecutor;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The locator process could not be run or exited abnormally
    #[error("Locator invocation failed: {0}")]
    Invocation(String),

    /// The locator ran but its report could not be parsed
    #[error("Failed to parse locator output: {0}")]
    Parse(String),

    /// A single-game preview matched zero or multiple library entries
    #[error("Lookup for \"{game}\" matched {matched} games")]
    Ambiguous { game: String, matched: u64 },
}

/// Discovered save set for one game. `files` holds only paths the locator
/// did not mark as ignored; an empty list is a valid result.
#[derive(Debug, Clone, PartialEq)]
pub struct GameSaves {
    pub game_name: String,
    pub files: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PreviewReport {
    overall: OverallBlock,
    #[serde(default)]
    games: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OverallBlock {
    #[serde(default)]
    total_games: u64,
}

#[derive(Debug, Deserialize)]
struct GameEntry {
    #[serde(default)]
    files: FilesBlock,
}

/// The files block in either of its two schemas.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FilesBlock {
    Table(BTreeMap<String, FileDetail>),
    List(Vec<FileRecord>),
}

impl Default for FilesBlock {
    fn default() -> Self {
        FilesBlock::Table(BTreeMap::new())
    }
}

#[derive(Debug, Deserialize)]
struct FileDetail {
    #[serde(default)]
    ignored: bool,
}

#[derive(Debug, Deserialize)]
struct FileRecord {
    path: String,
    #[serde(default)]
    ignored: bool,
}

impl FilesBlock {
    fn into_paths(self) -> Vec<String> {
        match self {
            FilesBlock::Table(table) => table
                .into_iter()
                .filter(|(_, detail)| !detail.ignored)
                .map(|(path, _)| path)
                .collect(),
            FilesBlock::List(records) => records
                .into_iter()
                .filter(|record| !record.ignored)
                .map(|record| record.path)
                .collect(),
        }
    }
}

/// Wrapper around the locator executable.
pub struct SaveLocator {
    executor: Arc<dyn CommandExecutor>,
    program: String,
}

impl SaveLocator {
    pub fn new(executor: Arc<dyn CommandExecutor>, program: &str) -> Self {
        Self {
            executor,
            program: program.to_string(),
        }
    }

    /// Discover the save files of a single game by display name.
    ///
    /// The preview must match exactly one library entry; anything else is an
    /// [`DiscoveryError::Ambiguous`] so the caller can surface an actionable
    /// message instead of silently snapshotting the wrong files.
    pub fn discover_one(&self, game_name: &str) -> Result<GameSaves, DiscoveryError> {
        let args = vec![
            "backup".to_string(),
            "--api".to_string(),
            "--preview".to_string(),
            "--preview-game".to_string(),
            game_name.to_string(),
        ];
        let report = self.run_preview(&args)?;

        if report.overall.total_games != 1 {
            return Err(DiscoveryError::Ambiguous {
                game: game_name.to_string(),
                matched: report.overall.total_games,
            });
        }

        let (name, value) = report
            .games
            .into_iter()
            .next()
            .ok_or_else(|| DiscoveryError::Parse("report has no game entry".to_string()))?;
        let entry: GameEntry = serde_json::from_value(value)
            .map_err(|e| DiscoveryError::Parse(format!("game entry for {}: {}", name, e)))?;

        let saves = GameSaves {
            game_name: name,
            files: entry.files.into_paths(),
        };
        debug!("Located {} save files for {}", saves.files.len(), game_name);
        Ok(saves)
    }

    /// Discover save files for every game the locator knows about.
    /// Individual malformed game entries are skipped with a warning rather
    /// than failing the whole sweep.
    pub fn discover_all(&self) -> Result<Vec<GameSaves>, DiscoveryError> {
        let args = vec![
            "backup".to_string(),
            "--api".to_string(),
            "--preview".to_string(),
        ];
        let report = self.run_preview(&args)?;

        let mut results = Vec::with_capacity(report.games.len());
        for (name, value) in report.games {
            match serde_json::from_value::<GameEntry>(value) {
                Ok(entry) => results.push(GameSaves {
                    files: entry.files.into_paths(),
                    game_name: name,
                }),
                Err(e) => warn!("Skipping malformed locator entry for {}: {}", name, e),
            }
        }
        Ok(results)
    }

    fn run_preview(&self, args: &[String]) -> Result<PreviewReport, DiscoveryError> {
        let output = self
            .executor
            .execute(&self.program, args, &HashMap::new())
            .map_err(|e| DiscoveryError::Invocation(e.to_string()))?;

        // Preview mode reports over stdout even on partial failures; an
        // unparseable report is the real failure signal.
        serde_json::from_str(&output.stdout)
            .map_err(|e| DiscoveryError::Parse(format!("{}: {}", e, truncate(&output.stdout))))
    }
}

fn truncate(s: &str) -> &str {
    let end = s.char_indices().nth(200).map_or(s.len(), |(i, _)| i);
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::executor::mock::{MockExecutor, MockResponse};

    const TABLE_REPORT: &str = r#"{
        "overall": {"totalGames": 1},
        "games": {
            "Hollow Knight": {
                "decision": "Processed",
                "files": {
                    "C:/saves/user1.dat": {"bytes": 1024},
                    "C:/saves/user2.dat": {"bytes": 2048, "ignored": true}
                }
            }
        }
    }"#;

    const LIST_REPORT: &str = r#"{
        "overall": {"totalGames": 1},
        "games": {
            "Hollow Knight": {
                "decision": "Processed",
                "files": [
                    {"path": "C:/saves/user1.dat", "bytes": 1024},
                    {"path": "C:/saves/user2.dat", "bytes": 2048, "ignored": true}
                ]
            }
        }
    }"#;

    fn locator(response: MockResponse) -> (SaveLocator, MockExecutor) {
        let executor = MockExecutor::new().expect("ludusavi", response);
        (
            SaveLocator::new(Arc::new(executor.clone()), "ludusavi"),
            executor,
        )
    }

    #[test]
    fn test_discover_one_table_schema() {
        let (locator, executor) = locator(MockResponse::ok(TABLE_REPORT));
        let saves = locator.discover_one("Hollow Knight").unwrap();

        assert_eq!(saves.game_name, "Hollow Knight");
        assert_eq!(saves.files, vec!["C:/saves/user1.dat"]);

        let call = &executor.get_calls()[0];
        assert_eq!(
            call.args,
            vec![
                "backup",
                "--api",
                "--preview",
                "--preview-game",
                "Hollow Knight"
            ]
        );
    }

    #[test]
    fn test_discover_one_list_schema() {
        let (locator, _) = locator(MockResponse::ok(LIST_REPORT));
        let saves = locator.discover_one("Hollow Knight").unwrap();
        assert_eq!(saves.files, vec!["C:/saves/user1.dat"]);
    }

    #[test]
    fn test_discover_one_zero_matches_is_ambiguous() {
        let report = r#"{"overall": {"totalGames": 0}, "games": {}}"#;
        let (locator, _) = locator(MockResponse::ok(report));

        let err = locator.discover_one("Unknown Game").unwrap_err();
        assert!(matches!(err, DiscoveryError::Ambiguous { matched: 0, .. }));
    }

    #[test]
    fn test_discover_one_multiple_matches_is_ambiguous() {
        let report = r#"{
            "overall": {"totalGames": 2},
            "games": {"A": {"files": {}}, "B": {"files": {}}}
        }"#;
        let (locator, _) = locator(MockResponse::ok(report));

        let err = locator.discover_one("A").unwrap_err();
        assert!(matches!(err, DiscoveryError::Ambiguous { matched: 2, .. }));
    }

    #[test]
    fn test_discover_one_garbage_output_is_parse_error() {
        let (locator, _) = locator(MockResponse::ok("not json at all"));
        let err = locator.discover_one("Any").unwrap_err();
        assert!(matches!(err, DiscoveryError::Parse(_)));
    }

    #[test]
    fn test_discover_one_start_failure_is_invocation_error() {
        let (locator, _) =
            locator(MockResponse::StartFailure("program not found".to_string()));
        let err = locator.discover_one("Any").unwrap_err();
        assert!(matches!(err, DiscoveryError::Invocation(_)));
    }

    #[test]
    fn test_discover_one_all_ignored_yields_empty_set() {
        let report = r#"{
            "overall": {"totalGames": 1},
            "games": {
                "Empty Game": {"files": {"C:/saves/x.dat": {"ignored": true}}}
            }
        }"#;
        let (locator, _) = locator(MockResponse::ok(report));
        let saves = locator.discover_one("Empty Game").unwrap();
        assert!(saves.files.is_empty());
    }

    #[test]
    fn test_discover_all_skips_malformed_entries() {
        let report = r#"{
            "overall": {"totalGames": 2},
            "games": {
                "Good": {"files": [{"path": "/saves/a.dat"}]},
                "Bad": {"files": 42}
            }
        }"#;
        let (locator, executor) = locator(MockResponse::ok(report));
        let all = locator.discover_all().unwrap();

        assert_eq!(all.len(), 1);
        assert_eq!(all[0].game_name, "Good");
        assert_eq!(all[0].files, vec!["/saves/a.dat"]);
        // No --preview-game for a full sweep
        assert_eq!(
            executor.get_calls()[0].args,
            vec!["backup", "--api", "--preview"]
        );
    }
}
