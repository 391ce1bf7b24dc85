use crate::error::{PenumbraError, Result};
use crate::types::{Config, ConfigUpdate};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard};

/// Mapping file loaded once at startup
///
/// Dispatch reads through [`ConfigStore::read`]; the administrative write path
/// goes through [`ConfigStore::update`], which persists before applying.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    config: RwLock<Config>,
}

impl ConfigStore {
    /// Load the mapping from `path`
    ///
    /// A missing file yields an empty but valid config. A file that exists but
    /// does not parse is an error.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config at {}, starting with an empty mapping", path.display());
                Config::default()
            }
            Err(e) => return Err(e.into()),
        };
        tracing::info!(
            "Loaded {} parameter mapping(s), {} universe(s) from {}",
            config.parameters.len(),
            config.universes.len(),
            path.display()
        );
        Ok(Self::with_config(path, config))
    }

    /// Wrap an in-memory config that saves to `path`
    pub fn with_config(path: impl Into<PathBuf>, config: Config) -> Self {
        Self {
            path: path.into(),
            config: RwLock::new(config),
        }
    }

    /// Path the mapping is persisted to
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Shared read access for the duration of one dispatch
    pub fn read(&self) -> RwLockReadGuard<'_, Config> {
        self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current mapping
    pub fn snapshot(&self) -> Config {
        self.read().clone()
    }

    /// Replace the universe and/or parameter tables and persist
    ///
    /// The new mapping is written to disk first; if that fails the in-memory
    /// mapping is left as it was and the error is returned to the caller.
    pub fn update(&self, update: ConfigUpdate) -> Result<()> {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);

        let mut next = config.clone();
        if let Some(universes) = update.universes {
            next.universes = universes;
        }
        if let Some(parameters) = update.parameters {
            next.parameters = parameters;
        }

        let json = serde_json::to_string_pretty(&next)?;
        std::fs::write(&self.path, json).map_err(|source| PenumbraError::ConfigSave {
            path: self.path.clone(),
            source,
        })?;

        tracing::info!(
            "Config updated: {} parameter mapping(s), {} universe(s)",
            next.parameters.len(),
            next.universes.len()
        );
        *config = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ParameterMapping, UniverseConfig};
    use std::collections::BTreeMap;

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("config.json")).unwrap();
        assert_eq!(store.snapshot(), Config::default());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ nope").unwrap();
        assert!(matches!(
            ConfigStore::load(&path),
            Err(PenumbraError::Json(_))
        ));
    }

    #[test]
    fn update_persists_and_applies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::load(&path).unwrap();

        store
            .update(ConfigUpdate {
                universes: None,
                parameters: Some(BTreeMap::from([(
                    "track1_dimmer".to_string(),
                    ParameterMapping { universe: 1, channel: 1 },
                )])),
            })
            .unwrap();

        assert!(store.read().mapping("track1_dimmer").is_some());
        let reloaded = ConfigStore::load(&path).unwrap();
        assert_eq!(reloaded.snapshot(), store.snapshot());
    }

    #[test]
    fn update_keeps_untouched_sections() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.universes.insert(
            "1".to_string(),
            UniverseConfig {
                ip: "10.0.0.20".to_string(),
                label: "front".to_string(),
            },
        );
        let store = ConfigStore::with_config(dir.path().join("config.json"), config);

        store
            .update(ConfigUpdate {
                universes: None,
                parameters: Some(BTreeMap::new()),
            })
            .unwrap();

        assert_eq!(store.read().universes["1"].label, "front");
    }

    #[test]
    fn failed_save_leaves_mapping_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be written as a file
        let store = ConfigStore::with_config(dir.path(), Config::default());

        let result = store.update(ConfigUpdate {
            universes: None,
            parameters: Some(BTreeMap::from([(
                "a".to_string(),
                ParameterMapping { universe: 1, channel: 2 },
            )])),
        });

        assert!(matches!(result, Err(PenumbraError::ConfigSave { .. })));
        assert!(store.read().parameters.is_empty());
    }
}
