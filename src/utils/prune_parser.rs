//! Tolerant parsing of retention-run output.
//!
//! The snapshotter's forget/prune reporting has changed shape across
//! releases: a structured JSON document, JSON-Lines progress records, or
//! plain text. Parsing degrades through those tiers and never fails — at
//! worst the result carries zero counts and the raw output for inspection.

use crate::utils::executor::CommandOutput;
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::debug;

/// Outcome of one retention run.
#[derive(Debug, Clone, PartialEq)]
pub struct PruneResult {
    /// Whether the run itself succeeded (a clean run that removed nothing
    /// is still a success)
    pub success: bool,
    pub snapshots_deleted: usize,
    /// Distinct games whose history was touched
    pub games_affected: usize,
    pub deleted_snapshots: Vec<DeletedSnapshot>,
    /// Human-readable space figure, when the tool reported one
    pub data_deleted: Option<String>,
    pub is_dry_run: bool,
    /// Verbatim tool output, always preserved
    pub raw_output: String,
}

impl PruneResult {
    pub fn invocation_failure(message: &str, is_dry_run: bool) -> Self {
        Self {
            success: false,
            snapshots_deleted: 0,
            games_affected: 0,
            deleted_snapshots: Vec::new(),
            data_deleted: None,
            is_dry_run,
            raw_output: message.to_string(),
        }
    }

    /// Empty successful result, the seed for folding several passes.
    pub fn clean(is_dry_run: bool) -> Self {
        Self {
            success: true,
            snapshots_deleted: 0,
            games_affected: 0,
            deleted_snapshots: Vec::new(),
            data_deleted: None,
            is_dry_run,
            raw_output: String::new(),
        }
    }

    /// Fold another run's result into this one. Used when a retention pass
    /// is split into several invocations; the combined run succeeds only if
    /// every pass did. Snapshots reported by more than one pass are merged
    /// by id, and the counts are recomputed from the merged list so
    /// `games_affected` stays the distinct-game count.
    pub fn absorb(&mut self, other: PruneResult) {
        self.success &= other.success;
        for snap in other.deleted_snapshots {
            // Identity-less records (counts-only output) cannot be deduped
            let known = !snap.id.is_empty()
                && self.deleted_snapshots.iter().any(|s| s.id == snap.id);
            if !known {
                self.deleted_snapshots.push(snap);
            }
        }
        self.snapshots_deleted = self.deleted_snapshots.len();
        self.games_affected = self
            .deleted_snapshots
            .iter()
            .filter(|s| !s.game_name.is_empty())
            .map(|s| s.game_name.as_str())
            .collect::<HashSet<_>>()
            .len();
        if self.data_deleted.is_none() {
            self.data_deleted = other.data_deleted;
        }
        if !other.raw_output.is_empty() {
            if !self.raw_output.is_empty() {
                self.raw_output.push('\n');
            }
            self.raw_output.push_str(&other.raw_output);
        }
    }
}

/// One snapshot removed (or slated for removal) by a retention run.
#[derive(Debug, Clone, PartialEq)]
pub struct DeletedSnapshot {
    pub id: String,
    pub short_id: String,
    pub time: Option<DateTime<Utc>>,
    /// First tag of the snapshot; empty when unknown
    pub game_name: String,
    pub tags: Vec<String>,
    pub host: String,
    pub paths: Vec<String>,
}

impl DeletedSnapshot {
    fn from_id(id: &str) -> Self {
        Self {
            short_id: id.chars().take(8).collect(),
            id: id.to_string(),
            time: None,
            game_name: String::new(),
            tags: Vec::new(),
            host: String::new(),
            paths: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ForgetGroup {
    #[serde(default)]
    remove: Option<Vec<SnapshotRecord>>,
}

#[derive(Debug, Deserialize)]
struct SnapshotRecord {
    id: String,
    #[serde(default)]
    short_id: String,
    #[serde(default)]
    time: Option<DateTime<Utc>>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    paths: Vec<String>,
}

impl From<SnapshotRecord> for DeletedSnapshot {
    fn from(snap: SnapshotRecord) -> Self {
        let game_name = snap.tags.first().cloned().unwrap_or_default();
        let short_id = if snap.short_id.is_empty() {
            snap.id.chars().take(8).collect()
        } else {
            snap.short_id
        };
        Self {
            id: snap.id,
            short_id,
            time: snap.time,
            game_name,
            tags: snap.tags,
            host: snap.hostname,
            paths: snap.paths,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PruneSummary {
    removed_snapshots: Vec<SnapshotRecord>,
}

#[derive(Debug, Deserialize)]
struct ProgressLine {
    #[serde(default)]
    action: String,
    /// Newer releases nest the snapshot record
    #[serde(default)]
    snapshot: Option<SnapshotRecord>,
    /// Older releases put the fields at the top level
    #[serde(default)]
    id: String,
    #[serde(default)]
    tags: Vec<String>,
}

/// Parse the output of a forget/prune run. Never fails; unrecognized
/// output yields zero counts with the raw text preserved.
pub fn parse_forget(output: &CommandOutput, is_dry_run: bool) -> PruneResult {
    let raw = output.combined();
    let mut result = PruneResult {
        success: output.success(),
        snapshots_deleted: 0,
        games_affected: 0,
        deleted_snapshots: Vec::new(),
        data_deleted: extract_data_figure(&raw),
        is_dry_run,
        raw_output: raw,
    };
    if !result.success {
        return result;
    }

    let deleted = parse_structured(&output.stdout)
        .or_else(|| parse_json_lines(&output.stdout))
        .unwrap_or_else(|| parse_free_text(&result.raw_output));

    result.snapshots_deleted = deleted.len();
    result.games_affected = deleted
        .iter()
        .filter(|s| !s.game_name.is_empty())
        .map(|s| s.game_name.as_str())
        .collect::<HashSet<_>>()
        .len();
    result.deleted_snapshots = deleted;
    result
}

/// Tier 1: a single JSON document, either the grouped forget report or the
/// prune summary with its `removed_snapshots` array.
fn parse_structured(stdout: &str) -> Option<Vec<DeletedSnapshot>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(groups) = serde_json::from_str::<Vec<ForgetGroup>>(trimmed) {
        debug!("Parsed grouped retention report ({} groups)", groups.len());
        return Some(
            groups
                .into_iter()
                .flat_map(|g| g.remove.unwrap_or_default())
                .map(DeletedSnapshot::from)
                .collect(),
        );
    }

    if let Ok(summary) = serde_json::from_str::<PruneSummary>(trimmed) {
        return Some(
            summary
                .removed_snapshots
                .into_iter()
                .map(DeletedSnapshot::from)
                .collect(),
        );
    }
    None
}

/// Tier 2: one JSON object per line, removal records flagged by their
/// `action` field. A line that fails to parse is skipped; the tier applies
/// only if at least one line is recognizably a progress record (carries an
/// `action`), so unrelated JSON output still falls through to the text
/// tier.
fn parse_json_lines(stdout: &str) -> Option<Vec<DeletedSnapshot>> {
    let mut any_json = false;
    let mut deleted = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        let Ok(record) = serde_json::from_str::<ProgressLine>(line) else {
            continue;
        };
        if record.action.is_empty() {
            continue;
        }
        any_json = true;
        if record.action != "remove" {
            continue;
        }
        if let Some(snap) = record.snapshot {
            deleted.push(DeletedSnapshot::from(snap));
        } else if !record.id.is_empty() {
            let mut snap = DeletedSnapshot::from_id(&record.id);
            snap.game_name = record.tags.first().cloned().unwrap_or_default();
            snap.tags = record.tags;
            deleted.push(snap);
        }
    }
    any_json.then_some(deleted)
}

fn removal_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)removing\s+.*?snapshot\s+([0-9a-f]{8,})").unwrap())
}

fn header_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([0-9a-f]{8,})\s+(\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}:\d{2})").unwrap()
    })
}

fn path_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(/|[A-Za-z]:\\)").unwrap())
}

fn data_figure_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(\d+(?:\.\d+)?\s*[KMGT]?i?B)\s+of\s+data").unwrap()
    })
}

fn data_figure_secondary_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(\d+(?:\.\d+)?\s*[KMGT]?i?B)\s+(?:was\s+)?(?:freed|deleted|removed)")
            .unwrap()
    })
}

/// Tier 3: scan plain-text output. "removing ... snapshot <id>" lines each
/// yield a minimal record; a snapshot-listing header opens a record whose
/// following lines may contribute a bracketed tag list or paths.
fn parse_free_text(raw: &str) -> Vec<DeletedSnapshot> {
    let mut deleted: Vec<DeletedSnapshot> = Vec::new();
    let mut seen = HashSet::new();
    // Index of the record opened by the most recent header line
    let mut pending: Option<usize> = None;

    for line in raw.lines() {
        if let Some(caps) = removal_line_regex().captures(line) {
            pending = None;
            if seen.insert(caps[1].to_string()) {
                deleted.push(DeletedSnapshot::from_id(&caps[1]));
            }
            continue;
        }

        let trimmed = line.trim();
        if let Some(caps) = header_line_regex().captures(trimmed) {
            if !seen.insert(caps[1].to_string()) {
                pending = None;
                continue;
            }
            let mut snap = DeletedSnapshot::from_id(&caps[1]);
            snap.time = NaiveDateTime::parse_from_str(
                &caps[2].replace('T', " "),
                "%Y-%m-%d %H:%M:%S",
            )
            .ok()
            .map(|t| t.and_utc());
            deleted.push(snap);
            pending = Some(deleted.len() - 1);
            continue;
        }

        let Some(index) = pending else { continue };
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            let tags: Vec<String> = trimmed[1..trimmed.len() - 1]
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
            if let Some(first) = tags.first() {
                deleted[index].game_name = first.clone();
            }
            deleted[index].tags = tags;
        } else if path_line_regex().is_match(trimmed) {
            deleted[index].paths.push(trimmed.to_string());
        }
    }
    deleted
}

fn extract_data_figure(raw: &str) -> Option<String> {
    data_figure_regex()
        .captures(raw)
        .or_else(|| data_figure_secondary_regex().captures(raw))
        .map(|caps| caps[1].to_string())
}
