//! Discovery of plugin binaries.
//!
//! Binaries are looked up by type: a plugin of type `slack` is served by
//! `<plugin_dir>/notification-slack`. The directory is scanned once when the
//! broker starts, and the catalog is owned by that broker.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::config::PluginConfig;
use crate::error::{BrokerError, Result};

/// File name prefix shared by all plugin binaries.
pub const BINARY_PREFIX: &str = "notification-";

/// The plugin binaries available in a directory, keyed by file name.
#[derive(Debug, Clone, Default)]
pub struct PluginCatalog {
    dir: PathBuf,
    binaries: BTreeMap<String, PathBuf>,
}

impl PluginCatalog {
    /// Scans `dir` for plugin binaries.
    ///
    /// Entries not following the naming scheme are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PluginDir`] if the directory cannot be listed.
    pub fn scan(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let dir_error = |source| BrokerError::PluginDir {
            path: dir.to_path_buf(),
            source,
        };

        let mut binaries = BTreeMap::new();
        for entry in std::fs::read_dir(dir).map_err(dir_error)? {
            let entry = entry.map_err(dir_error)?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };

            if name.strip_prefix(BINARY_PREFIX).is_some_and(|t| !t.is_empty()) {
                trace!(file = name, path = %entry.path().display(), "found plugin binary");
                binaries.insert(name.to_string(), entry.path());
            } else {
                trace!(file = name, "ignoring non-plugin file");
            }
        }

        debug!(dir = %dir.display(), count = binaries.len(), "scanned plugin directory");

        Ok(Self {
            dir: dir.to_path_buf(),
            binaries,
        })
    }

    /// The scanned directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of binaries found.
    #[must_use]
    pub fn len(&self) -> usize {
        self.binaries.len()
    }

    /// Returns true if no binaries were found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.binaries.is_empty()
    }

    /// The plugin types available, in sorted order.
    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.binaries
            .keys()
            .filter_map(|name| name.strip_prefix(BINARY_PREFIX))
    }

    /// Resolves the binary for a configured plugin.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PluginNotFound`] if no binary serves the
    /// plugin's type.
    pub fn resolve(&self, plugin: &PluginConfig) -> Result<&Path> {
        self.binaries
            .get(&plugin.binary_name())
            .map(PathBuf::as_path)
            .ok_or_else(|| BrokerError::PluginNotFound {
                plugin: plugin.name.clone(),
            })
    }
}
