//! blocksync configuration file parsing (blocksync.toml)

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::model::DEFAULT_BLOCK_SIZE;

/// Config file looked up in the working directory when `--config` is not given.
pub const CONFIG_FILE: &str = "blocksync.toml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Block size in bytes for hashing and deltas.
    pub block_size: usize,
    /// Source-of-truth root.
    pub dc_path: Option<PathBuf>,
    /// Disaster-recovery root.
    pub dr_path: Option<PathBuf>,
    pub snapshot_dir: PathBuf,
    pub snapshot_retention_days: u32,
    pub log_retention_days: u32,
    /// Defaults to `transfer-log.jsonl` next to `snapshot_dir`.
    pub audit_log: Option<PathBuf>,
    /// Period of the scheduled DC → DR incremental backup.
    pub auto_backup_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            dc_path: None,
            dr_path: None,
            snapshot_dir: default_snapshot_dir(),
            snapshot_retention_days: 30,
            log_retention_days: 30,
            audit_log: None,
            auto_backup_interval_secs: 3600,
        }
    }
}

fn default_snapshot_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("blocksync")
        .join("snapshots")
}

impl Config {
    /// Load from `path`, or from [`CONFIG_FILE`] in the working directory if it
    /// exists, or fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(CONFIG_FILE).exists() => Self::from_file(Path::new(CONFIG_FILE))?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SyncError::config(format!("cannot read {}: {e}", path.display())))?;
        let config = Self::parse(&content)
            .map_err(|e| SyncError::config(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(SyncError::config("block_size must be greater than zero"));
        }
        if self.snapshot_retention_days == 0 {
            return Err(SyncError::config("snapshot_retention_days must be at least 1"));
        }
        if self.auto_backup_interval_secs == 0 {
            return Err(SyncError::config("auto_backup_interval_secs must be at least 1"));
        }
        Ok(())
    }

    /// Both roots, or a config error naming the missing one.
    pub fn roots(&self) -> Result<(&Path, &Path)> {
        let dc = self
            .dc_path
            .as_deref()
            .ok_or_else(|| SyncError::config("dc_path is not set"))?;
        let dr = self
            .dr_path
            .as_deref()
            .ok_or_else(|| SyncError::config("dr_path is not set"))?;
        Ok((dc, dr))
    }

    pub fn audit_log_path(&self) -> PathBuf {
        match &self.audit_log {
            Some(path) => path.clone(),
            None => self
                .snapshot_dir
                .parent()
                .unwrap_or(&self.snapshot_dir)
                .join("transfer-log.jsonl"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.snapshot_retention_days, 30);
        assert_eq!(config.log_retention_days, 30);
        assert!(config.snapshot_dir.ends_with("blocksync/snapshots"));
        assert!(config.roots().is_err());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
block_size = 8192
dc_path = "/srv/dc"
dr_path = "/mnt/dr"
snapshot_dir = "/var/lib/blocksync/snapshots"
snapshot_retention_days = 7
log_retention_days = 90
"#;
        let config = Config::parse(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.block_size, 8192);
        let (dc, dr) = config.roots().unwrap();
        assert_eq!(dc, Path::new("/srv/dc"));
        assert_eq!(dr, Path::new("/mnt/dr"));
        assert_eq!(
            config.audit_log_path(),
            PathBuf::from("/var/lib/blocksync/transfer-log.jsonl")
        );
    }

    #[test]
    fn test_zero_block_size_rejected() {
        let config = Config::parse("block_size = 0").unwrap();
        assert!(matches!(config.validate(), Err(SyncError::Config { .. })));
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(Config::parse("blok_size = 10").is_err());
    }

    #[test]
    fn test_load_reports_path_on_error() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("bad.toml");
        std::fs::write(&path, "block_size = \"big\"").unwrap();
        let err = Config::load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }
}
