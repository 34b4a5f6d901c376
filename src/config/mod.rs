//! Configuration module for saveguard
//!
//! Handles loading and validating the TOML configuration, resolving the
//! effective per-game policy, and the copy-on-edit policy store shared by
//! concurrent backup tasks.
//!
//! ## Policy resolution
//!
//! Settings resolve in this order:
//! 1. Global policy defaults
//! 2. Per-game override fields (only when `override_global_settings` is set)
//!
//! Retention is the exception: a game that opts into custom retention gets
//! zeros for its unset counts instead of the global values.

mod loader;
mod resolver;
mod types;

pub use loader::{load_config, validate_policy, ConfigError, Result};
pub use resolver::{merge_extra_tags, resolve, PolicyStore};
pub use types::*;
