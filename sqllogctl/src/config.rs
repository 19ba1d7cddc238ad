//! On-disk configuration for the demonstration binary. A thin JSON layer
//! over [`sqllog::Options`] plus the handful of settings that are specific
//! to running the engine as a standalone process rather than embedded in a
//! larger server.

use std::path::{Path, PathBuf};

use serde_derive::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Path to the SQLite database file. `:memory:` is accepted for
    /// throwaway runs.
    pub db_path: String,
    /// Table name inside that database.
    pub table: String,
    /// Directory log files are written to.
    pub log_dir: PathBuf,
    pub poll_batch_size: i64,
    pub compact_min_retain: i64,
    pub compact_batch_size: i64,
}

impl Default for Config {
    fn default() -> Self {
        let defaults = sqllog::Options::default();
        Config {
            db_path: "sqllog.db".to_string(),
            table: "kine".to_string(),
            log_dir: PathBuf::from("logs"),
            poll_batch_size: defaults.poll_batch_size,
            compact_min_retain: defaults.compact_min_retain,
            compact_batch_size: defaults.compact_batch_size,
        }
    }
}

impl Config {
    /// Loads configuration from `path` if it exists, otherwise returns
    /// [`Config::default`] without touching disk.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn to_options(&self) -> sqllog::Options {
        sqllog::Options {
            poll_batch_size: self.poll_batch_size,
            compact_min_retain: self.compact_min_retain,
            compact_batch_size: self.compact_batch_size,
            ..sqllog::Options::default()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let config = Config::load(Path::new("/nonexistent/sqllogctl.json")).unwrap();
        assert_eq!(config.table, "kine");
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = Config::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.db_path, config.db_path);
        assert_eq!(loaded.poll_batch_size, config.poll_batch_size);
    }
}
