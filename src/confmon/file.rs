//! On-disk configuration cache.
//!
//! The file holds the last adopted configuration blob followed by
//! [`CACHE_MAGIC`]. A file without the marker is a torn write and is
//! deleted, as is one that no longer parses.

use super::provider::{ConfigProvider, ProviderContext, ProviderKind, ProviderOutput, ProviderState};
use crate::error::{Error, Result};
use crate::topology::{ClusterConfig, Distribution};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

/// Marker terminating a complete cache file.
pub const CACHE_MAGIC: &str = "{{{fb85b563d0a8f65fa8d3d58f1b3a0708}}}";

/// Host name given to configurations loaded from disk.
const CACHE_SOURCE_HOST: &str = "localhost";

/// Loads configurations from, and writes them back to, a cache file.
#[derive(Debug)]
pub struct FileProvider {
    path: PathBuf,
    last_mtime: Option<SystemTime>,
    cached: Option<Arc<ClusterConfig>>,
}

impl FileProvider {
    /// Create a provider for `path`. Nothing is read until the first refresh.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_mtime: None,
            cached: None,
        }
    }

    /// Cache file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the file if it changed since the last load.
    ///
    /// Returns `Ok(None)` when the file is unchanged.
    pub fn load(&mut self) -> Result<Option<Arc<ClusterConfig>>> {
        let mtime = fs::metadata(&self.path)?.modified()?;
        if self.last_mtime == Some(mtime) {
            tracing::info!(path = %self.path.display(), "Rejecting cache file, modification time unchanged");
            return Ok(None);
        }

        let contents = fs::read_to_string(&self.path)?;
        let Some(end) = contents.find(CACHE_MAGIC) else {
            tracing::error!(path = %self.path.display(), "Cache file has no end marker, removing");
            self.remove();
            return Err(Error::Io("cache file is incomplete".into()));
        };

        let config = match ClusterConfig::parse(&contents[..end], CACHE_SOURCE_HOST) {
            Ok(config) => config,
            Err(err) => {
                tracing::error!(path = %self.path.display(), error = %err, "Cache file unparsable, removing");
                self.remove();
                return Err(err);
            }
        };

        if config.distribution() != Distribution::Vbucket {
            tracing::error!(path = %self.path.display(), "Not applying cached ketama configuration");
            return Err(Error::Io("cached configuration is not vbucket-aware".into()));
        }

        let config = Arc::new(config);
        self.cached = Some(config.clone());
        self.last_mtime = Some(mtime);
        Ok(Some(config))
    }

    /// Write `config` followed by the end marker.
    pub fn write(&self, config: &ClusterConfig) -> Result<()> {
        let mut contents = String::with_capacity(config.source().len() + CACHE_MAGIC.len());
        contents.push_str(config.source());
        contents.push_str(CACHE_MAGIC);
        fs::write(&self.path, contents)?;
        Ok(())
    }

    fn remove(&self) {
        if let Err(err) = fs::remove_file(&self.path) {
            tracing::debug!(path = %self.path.display(), error = %err, "Could not remove cache file");
        }
    }
}

impl ConfigProvider for FileProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::File
    }

    fn state(&self) -> ProviderState {
        ProviderState::Idle
    }

    fn refresh(&mut self, _ctx: &mut ProviderContext<'_>) -> Option<ProviderOutput> {
        match self.load() {
            Ok(Some(config)) => Some(ProviderOutput::Config(config)),
            Ok(None) => Some(ProviderOutput::Failed(Error::Io(
                "cache file unchanged since last load".into(),
            ))),
            Err(err) => {
                tracing::debug!(path = %self.path.display(), error = %err, "No usable cache file");
                Some(ProviderOutput::Failed(err))
            }
        }
    }

    fn cached(&self) -> Option<Arc<ClusterConfig>> {
        self.cached.clone()
    }

    fn pause(&mut self, _ctx: &mut ProviderContext<'_>) {}

    fn config_updated(
        &mut self,
        config: &Arc<ClusterConfig>,
        origin: ProviderKind,
        _ctx: &mut ProviderContext<'_>,
    ) {
        if origin == ProviderKind::File {
            return;
        }
        tracing::debug!(path = %self.path.display(), revision = ?config.revision(), "Flushing configuration to cache file");
        if let Err(err) = self.write(config) {
            tracing::warn!(path = %self.path.display(), error = %err, "Failed to write cache file");
        }
    }
}
