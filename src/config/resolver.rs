//! Effective policy resolution and the shared policy store.
//!
//! The resolver is a pure function from (global policy, optional override)
//! to an [`EffectivePolicy`]; malformed overrides are dealt with at the edit
//! boundary (see `loader::normalize_overrides`), never here.

use super::loader::{validate_policy, ConfigError};
use super::types::{EffectivePolicy, GameOverride, GlobalPolicy, RetentionPolicy};
use std::sync::{Arc, RwLock};

/// Resolve the effective policy for one operation.
///
/// With no override, or an override whose master switch is off, every field
/// inherits from the global policy. Otherwise each unset field falls back to
/// the global value — except retention: once `use_custom_retention` is set,
/// unset counts resolve to 0 (disabled), so a custom retention fully
/// replaces the global policy for that game.
pub fn resolve(global: &GlobalPolicy, ovr: Option<&GameOverride>) -> EffectivePolicy {
    let ovr = match ovr {
        Some(o) if o.override_global_settings => o,
        _ => return EffectivePolicy::from_global(global),
    };

    let retention = if ovr.has_retention_override() {
        RetentionPolicy {
            keep_last: ovr.keep_last.unwrap_or(0),
            keep_daily: ovr.keep_daily.unwrap_or(0),
            keep_weekly: ovr.keep_weekly.unwrap_or(0),
            keep_monthly: ovr.keep_monthly.unwrap_or(0),
            keep_yearly: ovr.keep_yearly.unwrap_or(0),
        }
    } else {
        global.retention.clone()
    };

    EffectivePolicy {
        backup_on_stop: ovr.backup_on_stop.unwrap_or(global.backup_on_stop),
        backup_during_play: ovr.backup_during_play.unwrap_or(global.backup_during_play),
        gameplay_interval_minutes: ovr
            .gameplay_interval_minutes
            .unwrap_or(global.gameplay_interval_minutes),
        backup_on_uninstall: ovr.backup_on_uninstall.unwrap_or(global.backup_on_uninstall),
        retention,
        extra_tags: merge_extra_tags(&ovr.custom_tags, &[]),
    }
}

/// Union two tag lists, de-duplicating case-insensitively while preserving
/// first-occurrence order.
pub fn merge_extra_tags(base: &[String], extra: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(base.len() + extra.len());
    for tag in base.iter().chain(extra.iter()) {
        let trimmed = tag.trim();
        if trimmed.is_empty() {
            continue;
        }
        if !merged.iter().any(|t| t.eq_ignore_ascii_case(trimmed)) {
            merged.push(trimmed.to_string());
        }
    }
    merged
}

/// Shared, concurrently-read policy state.
///
/// Readers take an `Arc` snapshot at the moment an operation begins and keep
/// it for the whole operation; edits clone the current policy, mutate the
/// clone, validate, then swap. A failed edit leaves the installed policy
/// untouched.
pub struct PolicyStore {
    inner: RwLock<Arc<GlobalPolicy>>,
}

impl PolicyStore {
    pub fn new(policy: GlobalPolicy) -> Self {
        Self {
            inner: RwLock::new(Arc::new(policy)),
        }
    }

    /// Atomic snapshot of the current policy.
    pub fn snapshot(&self) -> Arc<GlobalPolicy> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Copy-modify-validate-swap edit. The closure mutates a draft; on any
    /// error the draft is discarded and the previous policy stays installed.
    pub fn edit<F>(&self, mutate: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut GlobalPolicy) -> Result<(), ConfigError>,
    {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let mut draft = (**guard).clone();
        mutate(&mut draft)?;
        validate_policy(&draft)?;
        *guard = Arc::new(draft);
        Ok(())
    }

    /// Remove a game's override record, reverting it to the global policy.
    pub fn reset_override(&self, game_id: &str) -> Result<(), ConfigError> {
        self.edit(|policy| {
            policy.overrides.remove(game_id);
            Ok(())
        })
    }
}
