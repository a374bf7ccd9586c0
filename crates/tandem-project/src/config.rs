//! Project configuration (`tandem.toml`) and per-checkout session state

use crate::error::{ProjectError, ProjectResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tandem_core::TieBreak;
use tracing::debug;

/// Name of the config file at the project root
pub const CONFIG_FILE: &str = "tandem.toml";
/// Directory holding the store and session files
pub const STATE_DIR: &str = ".tandem";
pub const STORE_FILE: &str = "store.db";
pub const SESSION_FILE: &str = "session.toml";

pub const DEFAULT_DEBOUNCE_MS: u64 = 100;

/// Paths never mirrored into the store, in gitignore syntax
const DEFAULT_IGNORE: &[&str] = &[
    ".tandem",
    ".godot",
    ".git",
    "tandem.toml",
    "*.tmp",
    "*~",
    ".DS_Store",
    "Thumbs.db",
    "desktop.ini",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProjectConfig {
    pub user: UserConfig,
    pub fs: FsConfig,
    pub merge: MergeConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UserConfig {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FsConfig {
    pub debounce_ms: u64,
    pub ignore: Vec<String>,
    /// Worker count for store-to-disk passes
    pub workers: usize,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            ignore: DEFAULT_IGNORE.iter().map(|s| s.to_string()).collect(),
            workers: 4,
        }
    }
}

impl FsConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MergeConfig {
    #[serde(with = "tie_break_str")]
    pub tie_break: TieBreak,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub server_url: Option<String>,
    pub peer_id: Option<String>,
}

mod tie_break_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use tandem_core::TieBreak;

    pub fn serialize<S: Serializer>(value: &TieBreak, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<TieBreak, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl ProjectConfig {
    /// Load from `path`; a missing file yields the defaults
    pub fn load(path: impl AsRef<Path>) -> ProjectResult<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => {
                debug!(path = %path.display(), "Loaded project config");
                Self::from_toml(&text)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn from_toml(text: &str) -> ProjectResult<Self> {
        toml::from_str(text).map_err(|e| ProjectError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> ProjectResult<String> {
        toml::to_string_pretty(self).map_err(|e| ProjectError::Config(e.to_string()))
    }

    pub fn path_in(root: &Path) -> PathBuf {
        root.join(CONFIG_FILE)
    }
}

/// Which project and branch this checkout was last using
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionState {
    pub project_id: Option<String>,
    pub checked_out_branch: Option<String>,
    pub session_id: Option<String>,
    pub username: Option<String>,
}

impl SessionState {
    pub fn path_in(root: &Path) -> PathBuf {
        root.join(STATE_DIR).join(SESSION_FILE)
    }

    pub fn load(path: impl AsRef<Path>) -> ProjectResult<Self> {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(text) => toml::from_str(&text).map_err(|e| ProjectError::Config(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> ProjectResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| ProjectError::Config(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProjectConfig::load(dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config, ProjectConfig::default());
        assert_eq!(config.fs.debounce(), Duration::from_millis(100));
        assert_eq!(config.merge.tie_break, TieBreak::Lamport);
        assert!(config.fs.ignore.contains(&".tandem".to_string()));
    }

    #[test]
    fn test_partial_file() {
        let config = ProjectConfig::from_toml(
            r#"
            [user]
            name = "alice"

            [fs]
            debounce_ms = 250

            [merge]
            tie_break = "timestamp"
            "#,
        )
        .unwrap();
        assert_eq!(config.user.name.as_deref(), Some("alice"));
        assert_eq!(config.fs.debounce_ms, 250);
        assert_eq!(config.fs.workers, 4);
        assert_eq!(config.merge.tie_break, TieBreak::Timestamp);
        assert!(config.sync.server_url.is_none());
    }

    #[test]
    fn test_bad_tie_break_is_config_error() {
        let err = ProjectConfig::from_toml("[merge]\ntie_break = \"coin-flip\"\n").unwrap_err();
        assert!(matches!(err, ProjectError::Config(_)));
    }

    #[test]
    fn test_session_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = SessionState::path_in(dir.path());
        assert_eq!(SessionState::load(&path).unwrap(), SessionState::default());

        let state = SessionState {
            project_id: Some("project:1".into()),
            checked_out_branch: Some("branch:2".into()),
            session_id: Some("abc".into()),
            username: Some("bob".into()),
        };
        state.save(&path).unwrap();
        assert_eq!(SessionState::load(&path).unwrap(), state);
    }
}
