//! Persisted set of command ids the user has denied.
//!
//! The command bridge can report a command again after it was denied here. Keeping
//! the id lets the approval flow ignore that duplicate instead of asking twice.
//! Each entry carries the time of denial, so eviction never depends on how ids are
//! generated.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeniedEntry {
    pub id: String,
    pub denied_at: DateTime<Utc>,
}

pub struct DeniedIds {
    /// `None` keeps the set in memory only
    path: Option<PathBuf>,
    entries: RwLock<Vec<DeniedEntry>>,
}

impl DeniedIds {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Open the set stored at `path`. A missing file is an empty set.
    pub fn open(path: &Path) -> Result<Self> {
        let entries = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading denied ids from {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("parsing denied ids in {}", path.display()))?
        } else {
            Vec::new()
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            entries: RwLock::new(entries),
        })
    }

    /// `<config dir>/localchat/denied_commands.json`
    pub fn default_path() -> Option<PathBuf> {
        shared::settings::config_dir().map(|p| p.join("denied_commands.json"))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().iter().any(|e| e.id == id)
    }

    /// Record a denial. Re-denying an id keeps the original time.
    pub fn insert(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        {
            let mut entries = self.entries.write();
            if entries.iter().any(|e| e.id == id) {
                return Ok(());
            }
            entries.push(DeniedEntry {
                id: id.to_string(),
                denied_at: at,
            });
        }
        self.save()
    }

    /// Forget ids denied more than `ttl` before `now`. Returns how many were removed.
    pub fn prune(&self, now: DateTime<Utc>, ttl: Duration) -> Result<usize> {
        let removed = {
            let mut entries = self.entries.write();
            let before = entries.len();
            entries.retain(|e| now - e.denied_at <= ttl);
            before - entries.len()
        };
        if removed > 0 {
            tracing::debug!("Pruned {} expired denied command ids", removed);
            self.save()?;
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn list(&self) -> Vec<DeniedEntry> {
        self.entries.read().clone()
    }

    pub fn clear(&self) -> Result<()> {
        self.entries.write().clear();
        self.save()
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&*self.entries.read())?;
        std::fs::write(path, json)
            .with_context(|| format!("writing denied ids to {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_insert_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("denied.json");
        let now = Utc::now();

        let ids = DeniedIds::open(&path).unwrap();
        assert!(ids.is_empty());
        ids.insert("1718000000000", now).unwrap();
        ids.insert("1718000000000", now + Duration::hours(1)).unwrap();
        assert_eq!(ids.len(), 1);

        let reopened = DeniedIds::open(&path).unwrap();
        assert!(reopened.contains("1718000000000"));
        assert_eq!(reopened.list()[0].denied_at, now);
    }

    #[test]
    fn test_prune_uses_denial_time() {
        let ids = DeniedIds::in_memory();
        let now = Utc::now();
        // id text looks nothing like a timestamp
        ids.insert("cmd-a", now - Duration::hours(30)).unwrap();
        ids.insert("cmd-b", now - Duration::hours(2)).unwrap();

        assert_eq!(ids.prune(now, Duration::hours(24)).unwrap(), 1);
        assert!(!ids.contains("cmd-a"));
        assert!(ids.contains("cmd-b"));
    }

    #[test]
    fn test_clear_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("denied.json");
        let ids = DeniedIds::open(&path).unwrap();
        ids.insert("x", Utc::now()).unwrap();
        ids.clear().unwrap();
        assert!(DeniedIds::open(&path).unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("denied.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(DeniedIds::open(&path).is_err());
    }
}
