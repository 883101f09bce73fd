//! The local library directory: the last-resort tier, shipped alongside
//! the binary.
//!
//! File names are matched loosely since the library is hand-maintained:
//! `Agent_X.txt` and `agent x.txt` both satisfy a lookup for `agent-x.txt`.

use adcp_core::config::SourceTier;
use adcp_core::error::StoreError;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Lowercase a name and fold `_` and spaces to `-`.
pub fn normalize_name(name: &str) -> String {
    name.to_lowercase().replace(['_', ' '], "-")
}

fn io_error(path: &Path, e: std::io::Error) -> StoreError {
    StoreError::TransientIo {
        tier: SourceTier::Filesystem,
        reason: format!("{}: {e}", path.display()),
    }
}

/// A directory tree laid out like the object store prefix.
#[derive(Debug, Clone)]
pub struct LocalLibrary {
    root: PathBuf,
}

impl LocalLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read `relative` under the root. An exact path match wins; otherwise
    /// the parent directory is scanned for a file whose normalized name
    /// matches. `Ok(None)` when nothing matches.
    ///
    /// Paths that could leave the root (`..`, absolute paths) are rejected
    /// as malformed.
    pub async fn read(&self, relative: &str) -> Result<Option<String>, StoreError> {
        let escapes = Path::new(relative)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes || relative.is_empty() {
            return Err(StoreError::Malformed {
                tier: SourceTier::Filesystem,
                key: relative.to_string(),
                reason: "library path must be a plain relative path".into(),
            });
        }
        let exact = self.root.join(relative);
        match tokio::fs::read_to_string(&exact).await {
            Ok(text) => return Ok(Some(text)),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(&exact, e)),
        }

        let Some(file_name) = exact.file_name().and_then(|n| n.to_str()) else {
            return Ok(None);
        };
        let Some(dir) = exact.parent() else {
            return Ok(None);
        };
        let Some(found) = self.find_flexible(dir, file_name).await? else {
            return Ok(None);
        };

        debug!(requested = %relative, found = %found.display(), "Library flexible match");
        match tokio::fs::read_to_string(&found).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&found, e)),
        }
    }

    async fn find_flexible(
        &self,
        dir: &Path,
        file_name: &str,
    ) -> Result<Option<PathBuf>, StoreError> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(dir, e)),
        };

        let target = normalize_name(file_name);
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(dir, e))? {
            if let Some(name) = entry.file_name().to_str()
                && normalize_name(name) == target
            {
                return Ok(Some(entry.path()));
            }
        }
        Ok(None)
    }

    /// Agents with an instruction file, skipping files starting with `_`.
    pub async fn list_agents(&self) -> Result<Vec<String>, StoreError> {
        let dir = self.root.join("agent-instructions-library");
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&dir, e)),
        };

        let mut agents = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('_') {
                continue;
            }
            if let Some(agent) = name.strip_suffix(".txt") {
                agents.push(agent.to_string());
            }
        }
        agents.sort();
        Ok(agents)
    }
}
