//! Scenario catalogues.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tq_common::EventSink;

use crate::{
    scenario::{ScenarioConfig, ScenarioFile},
    Error, Result,
};

/// A source of scenarios.
#[async_trait]
pub trait ScenarioProvider: Send + Sync + fmt::Debug {
    /// Names of the scenarios currently available, sorted.
    fn list(&self) -> Vec<String>;

    /// Description of the named scenario.
    fn details(&self, name: &str) -> Option<String>;

    /// Loads the named scenario with both of its traces.
    async fn load(&self, name: &str) -> Result<ScenarioConfig>;
}

#[derive(Debug, Clone)]
struct IndexEntry {
    file: PathBuf,
    description: String,
}

/// Serves the `*.json` scenario files of a directory.
///
/// The index is built by [`DirectoryProvider::refresh`]. Every refresh publishes whether the
/// directory is available to the receivers returned by [`DirectoryProvider::subscribe`].
#[derive(Debug)]
pub struct DirectoryProvider {
    path: PathBuf,
    index: RwLock<FxHashMap<String, IndexEntry>>,
    available: watch::Sender<bool>,
    events: Arc<dyn EventSink>,
}

impl DirectoryProvider {
    pub fn new(path: impl Into<PathBuf>, events: Arc<dyn EventSink>) -> Self {
        let (available, _) = watch::channel(false);
        Self {
            path: path.into(),
            index: RwLock::default(),
            available,
            events,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Availability of the scenario directory, updated on every refresh.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.available.subscribe()
    }

    pub fn is_available(&self) -> bool {
        *self.available.borrow()
    }

    /// Rescans the directory and returns the number of scenarios found.
    ///
    /// A missing directory empties the index and is reported as unavailable. Files that cannot
    /// be read or parsed are logged and skipped.
    pub async fn refresh(&self) -> Result<usize> {
        let mut index = FxHashMap::default();

        let mut dir = match tokio::fs::read_dir(&self.path).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.events.debug(&format!(
                    "Scenario path {} is not available.",
                    self.path.display()
                ));
                self.index.write().clear();
                self.available.send_replace(false);
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = dir.next_entry().await? {
            let file = entry.path();
            if file.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }

            match read_header(&file).await {
                Ok(header) => {
                    tracing::debug!(
                        name = %header.name,
                        file = %file.display(),
                        "indexed scenario"
                    );
                    index.insert(
                        header.name,
                        IndexEntry {
                            file,
                            description: header.description,
                        },
                    );
                }
                Err(e) => self.events.error(&format!("Error while loading: {e}")),
            }
        }

        let count = index.len();
        *self.index.write() = index;
        self.available.send_replace(true);
        self.events.info(&format!("Loaded scenarios from: {}", self.path.display()));

        Ok(count)
    }
}

async fn read_header(path: &Path) -> Result<ScenarioFile> {
    let contents = tokio::fs::read(path)
        .await
        .map_err(|e| Error::from(e).in_file(path))?;
    serde_json::from_slice(&contents).map_err(|e| Error::from(e).in_file(path))
}

#[async_trait]
impl ScenarioProvider for DirectoryProvider {
    fn list(&self) -> Vec<String> {
        let mut names: Vec<_> = self.index.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn details(&self, name: &str) -> Option<String> {
        self.index
            .read()
            .get(name)
            .map(|entry| entry.description.clone())
    }

    async fn load(&self, name: &str) -> Result<ScenarioConfig> {
        let file = self
            .index
            .read()
            .get(name)
            .map(|entry| entry.file.clone())
            .ok_or_else(|| Error::UnknownScenario(name.to_string()))?;

        ScenarioConfig::from_file(file).await
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tq_common::{Level, MemorySink};

    use super::*;

    fn scenario(dir: &Path, file: &str, name: &str) {
        fs::write(dir.join(format!("{name}.csv")), "1000,5000,1000000,0,50\n").unwrap();
        fs::write(
            dir.join(file),
            format!(
                r#"{{"name": "{name}", "description": "{name} link",
                    "trace": {{"format": "simple", "forward": "{name}.csv", "return": "{name}.csv"}}}}"#
            ),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn indexes_json_files() {
        let dir = tempfile::tempdir().unwrap();
        scenario(dir.path(), "b.json", "Satellite");
        scenario(dir.path(), "a.json", "Cellular");
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        fs::write(dir.path().join("broken.json"), "{").unwrap();

        let events = Arc::new(MemorySink::default());
        let provider = DirectoryProvider::new(dir.path(), events.clone());
        let mut available = provider.subscribe();

        assert_eq!(provider.refresh().await.unwrap(), 2);
        assert_eq!(provider.list(), vec!["Cellular", "Satellite"]);
        assert_eq!(provider.details("Satellite").as_deref(), Some("Satellite link"));
        assert_eq!(provider.details("Fiber"), None);
        assert!(events.contains(Level::Error, "broken.json"));

        assert!(available.has_changed().unwrap());
        assert!(*available.borrow_and_update());

        let scenario = provider.load("Cellular").await.unwrap();
        assert_eq!(scenario.name(), "Cellular");
        assert_eq!(scenario.video(), None);
        assert_eq!(scenario.total_duration(), 1_000_000);
    }

    #[tokio::test]
    async fn unknown_scenarios_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let provider = DirectoryProvider::new(dir.path(), Arc::new(MemorySink::default()));
        provider.refresh().await.unwrap();

        let result = provider.load("Fiber").await;
        assert!(matches!(result, Err(Error::UnknownScenario(_))));
    }

    #[tokio::test]
    async fn missing_directory_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        scenario(dir.path(), "a.json", "Cellular");

        let provider = DirectoryProvider::new(dir.path(), Arc::new(MemorySink::default()));
        provider.refresh().await.unwrap();
        assert!(provider.is_available());

        let path = dir.path().to_path_buf();
        drop(dir);
        assert!(!path.exists());

        assert_eq!(provider.refresh().await.unwrap(), 0);
        assert!(!provider.is_available());
        assert!(provider.list().is_empty());
    }
}
