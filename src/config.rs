//! Sync configuration persisted as key/values in the store.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::Store;

/// Direction gating for the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    #[default]
    Bidirectional,
    /// Local changes propagate to the remote; remote changes are suppressed.
    SourceToTarget,
    /// Remote changes propagate locally; local changes are suppressed.
    TargetToSource,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Bidirectional => "bidirectional",
            SyncMode::SourceToTarget => "source-to-target",
            SyncMode::TargetToSource => "target-to-source",
        }
    }

    /// May local changes flow to the remote?
    pub fn allows_push(&self) -> bool {
        !matches!(self, SyncMode::TargetToSource)
    }

    /// May remote changes flow to the local tree?
    pub fn allows_pull(&self) -> bool {
        !matches!(self, SyncMode::SourceToTarget)
    }
}

impl FromStr for SyncMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bidirectional" => Ok(SyncMode::Bidirectional),
            "source-to-target" => Ok(SyncMode::SourceToTarget),
            "target-to-source" => Ok(SyncMode::TargetToSource),
            other => Err(Error::Config(format!("unknown sync mode: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// WebDAV endpoint, e.g. `https://dav.example.com`.
    pub url: String,
    pub user: String,
    pub pass: String,
    /// Local sync root.
    pub local_dir: PathBuf,
    /// Remote collection mirrored by the sync root.
    pub remote_dir: String,
    pub mode: SyncMode,
}

impl SyncConfig {
    /// Load from the config table, falling back to defaults for missing
    /// keys. Unknown keys are ignored.
    pub async fn load(store: &Store) -> Result<Self> {
        let mut cfg = SyncConfig::default();
        for (key, value) in store.get_all_config().await? {
            match key.as_str() {
                "url" => cfg.url = value,
                "user" => cfg.user = value,
                "pass" => cfg.pass = value,
                "local_dir" => cfg.local_dir = PathBuf::from(value),
                "remote_dir" => cfg.remote_dir = value,
                "mode" => cfg.mode = value.parse().unwrap_or_default(),
                _ => {}
            }
        }
        Ok(cfg)
    }

    /// Persist all keys in a single transaction.
    pub async fn save(&self, store: &Store) -> Result<()> {
        let local_dir = self.local_dir.to_string_lossy();
        store
            .put_config(&[
                ("url", self.url.as_str()),
                ("user", self.user.as_str()),
                ("pass", self.pass.as_str()),
                ("local_dir", local_dir.as_ref()),
                ("remote_dir", self.remote_dir.as_str()),
                ("mode", self.mode.as_str()),
            ])
            .await
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(Error::Config("url is not set".into()));
        }
        if self.local_dir.as_os_str().is_empty() {
            return Err(Error::Config("local_dir is not set".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use pretty_assertions::assert_eq;

    #[test]
    fn mode_parsing() {
        assert_eq!(
            "bidirectional".parse::<SyncMode>().unwrap(),
            SyncMode::Bidirectional
        );
        assert_eq!(
            "source-to-target".parse::<SyncMode>().unwrap(),
            SyncMode::SourceToTarget
        );
        assert!("mirror".parse::<SyncMode>().is_err());
    }

    #[test]
    fn mode_gating() {
        assert!(SyncMode::Bidirectional.allows_push());
        assert!(SyncMode::Bidirectional.allows_pull());
        assert!(SyncMode::SourceToTarget.allows_push());
        assert!(!SyncMode::SourceToTarget.allows_pull());
        assert!(!SyncMode::TargetToSource.allows_push());
        assert!(SyncMode::TargetToSource.allows_pull());
    }

    #[tokio::test]
    async fn round_trips_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("sync.db")).await.unwrap();

        let cfg = SyncConfig {
            url: "https://dav.example.com".into(),
            user: "alice".into(),
            pass: "secret".into(),
            local_dir: PathBuf::from("/data/sync"),
            remote_dir: "/backup".into(),
            mode: SyncMode::TargetToSource,
        };
        cfg.save(&store).await.unwrap();

        let loaded = SyncConfig::load(&store).await.unwrap();
        assert_eq!(loaded, cfg);
    }

    #[tokio::test]
    async fn unknown_keys_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("sync.db")).await.unwrap();

        store
            .put_config(&[("url", "https://dav.example.com"), ("theme", "dark")])
            .await
            .unwrap();

        let loaded = SyncConfig::load(&store).await.unwrap();
        assert_eq!(loaded.url, "https://dav.example.com");
        assert_eq!(loaded.mode, SyncMode::Bidirectional);
    }
}
