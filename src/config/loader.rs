use super::types::*;
use std::fs;
use std::path::Path;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Load and validate configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = fs::read_to_string(path)?;
    let mut config: Config = toml::from_str(&contents)?;
    normalize_overrides(&mut config.policy);
    validate_policy(&config.policy)?;
    Ok(config)
}

/// Validate a policy. Also used by the store on every edit, so a commit can
/// never install an invalid policy.
pub fn validate_policy(policy: &GlobalPolicy) -> Result<()> {
    if policy.locator_path.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "locator_path must not be empty".to_string(),
        ));
    }

    if policy.snapshotter_path.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "snapshotter_path must not be empty".to_string(),
        ));
    }

    if policy.repository.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "repository must not be empty".to_string(),
        ));
    }

    if policy.backup_during_play && policy.gameplay_interval_minutes == 0 {
        return Err(ConfigError::ValidationError(
            "gameplay_interval_minutes must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

/// Drop malformed override fields so the resolver never has to reason about
/// them: a zero interval reverts to "inherit global".
pub fn normalize_overrides(policy: &mut GlobalPolicy) {
    for (game_id, ovr) in policy.overrides.iter_mut() {
        if ovr.gameplay_interval_minutes == Some(0) {
            warn!(
                "Override for {} has a zero gameplay interval, using global",
                game_id
            );
            ovr.gameplay_interval_minutes = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MINIMAL: &str = r#"
[policy]
repository = "/backups/saves"
password = "hunter2"
"#;

    #[test]
    fn test_load_minimal_config() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.policy.repository, "/backups/saves");
        assert_eq!(config.policy.locator_path, "ludusavi");
        assert_eq!(config.policy.snapshotter_path, "restic");
        assert!(config.policy.backup_on_stop);
        assert_eq!(config.policy.retention.keep_daily, 7);
        assert!(config.policy.overrides.is_empty());
        assert!(config.notifications.webhook_url.is_empty());
    }

    #[test]
    fn test_load_config_with_override() {
        let toml = r#"
[policy]
repository = "/backups/saves"
password = "hunter2"
backup_during_play = true
gameplay_interval_minutes = 30

[policy.retention]
keep_last = 10

[policy.overrides."game-123"]
game_name = "Hollow Knight"
override_global_settings = true
backup_on_stop = false
use_custom_retention = true
keep_last = 3
custom_tags = ["metroidvania"]
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(toml.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.policy.retention.keep_last, 10);

        let ovr = &config.policy.overrides["game-123"];
        assert!(ovr.override_global_settings);
        assert_eq!(ovr.backup_on_stop, Some(false));
        assert_eq!(ovr.keep_last, Some(3));
        assert_eq!(ovr.keep_daily, None);
        assert_eq!(ovr.custom_tags, vec!["metroidvania".to_string()]);
    }

    #[test]
    fn test_missing_repository_rejected() {
        let toml = r#"
[policy]
repository = ""
password = "hunter2"
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(toml.as_bytes()).unwrap();

        let err = load_config(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_zero_gameplay_interval_rejected() {
        let toml = r#"
[policy]
repository = "/backups/saves"
password = "hunter2"
backup_during_play = true
gameplay_interval_minutes = 0
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(toml.as_bytes()).unwrap();

        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_zero_override_interval_normalized_to_inherit() {
        let toml = r#"
[policy]
repository = "/backups/saves"
password = "hunter2"

[policy.overrides."game-1"]
override_global_settings = true
gameplay_interval_minutes = 0
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(toml.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(
            config.policy.overrides["game-1"].gameplay_interval_minutes,
            None
        );
    }
}
