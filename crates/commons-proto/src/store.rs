//! Opaque string key-value persistence for listener preferences.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::warn;

pub const LAST_PLAYED_KEY: &str = "last-played-station";
pub const FAVORITES_KEY: &str = "commons-favorites";
pub const VOLUME_KEY: &str = "volume";

pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()>;
}

/// A JSON object on disk, rewritten on every `set`.
pub struct JsonFileStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl JsonFileStore {
    /// Opens `path`, starting empty if the file is missing or unreadable.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = Self::load(&path).unwrap_or_default();
        Self { path, entries }
    }

    fn load(path: &Path) -> Option<BTreeMap<String, String>> {
        let content = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str(&content) {
            Ok(entries) => Some(entries),
            Err(e) => {
                warn!("Ignoring unreadable prefs file {}: {}", path.display(), e);
                None
            }
        }
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.entries)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

/// In-memory store for sessions that should not touch disk.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: BTreeMap<String, String>,
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Favorites are kept as a JSON array of station ids under [`FAVORITES_KEY`].
pub fn load_favorites(store: &dyn KeyValueStore) -> Vec<String> {
    store
        .get(FAVORITES_KEY)
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

/// Adds or removes `station_id`; returns the updated list.
pub fn toggle_favorite(
    store: &mut dyn KeyValueStore,
    station_id: &str,
) -> anyhow::Result<Vec<String>> {
    let mut favorites = load_favorites(store);
    if let Some(pos) = favorites.iter().position(|id| id == station_id) {
        favorites.remove(pos);
    } else {
        favorites.push(station_id.to_string());
    }
    store.set(FAVORITES_KEY, &serde_json::to_string(&favorites)?)?;
    Ok(favorites)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("prefs.json");

        let mut store = JsonFileStore::open(&path);
        assert_eq!(store.get(LAST_PLAYED_KEY), None);
        store.set(LAST_PLAYED_KEY, "kpfa").unwrap();

        let reopened = JsonFileStore::open(&path);
        assert_eq!(reopened.get(LAST_PLAYED_KEY).as_deref(), Some("kpfa"));
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        std::fs::write(&path, "not json").unwrap();
        let store = JsonFileStore::open(&path);
        assert_eq!(store.get(VOLUME_KEY), None);
    }

    #[test]
    fn toggle_favorite_adds_then_removes() {
        let mut store = MemoryStore::default();
        assert_eq!(toggle_favorite(&mut store, "kexp").unwrap(), vec!["kexp"]);
        assert_eq!(
            toggle_favorite(&mut store, "kpfa").unwrap(),
            vec!["kexp", "kpfa"]
        );
        assert_eq!(toggle_favorite(&mut store, "kexp").unwrap(), vec!["kpfa"]);
        assert_eq!(load_favorites(&store), vec!["kpfa"]);
    }
}
