//! Manifest discovery and directory scanning
//!
//! Finds `*.plug.json` manifest files in plug directories.

use plugos_api::Manifest;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name suffix of plug manifests
pub const MANIFEST_SUFFIX: &str = ".plug.json";

/// Errors that can occur during manifest discovery
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("Failed to read directory: {0}")]
    ReadDirectory(#[source] std::io::Error),

    #[error("Failed to read manifest {path}: {source}")]
    ReadManifest {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse manifest {path}: {source}")]
    ParseManifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A manifest and the file it came from
#[derive(Debug, Clone)]
pub struct DiscoveredManifest {
    pub path: PathBuf,
    pub manifest: Manifest,
}

/// Result of manifest discovery
#[derive(Debug, Default)]
pub struct DiscoveryResult {
    /// Successfully parsed manifests
    pub manifests: Vec<DiscoveredManifest>,

    /// Files or directories that failed (with errors)
    pub failures: Vec<(PathBuf, DiscoveryError)>,
}

impl DiscoveryResult {
    /// Returns true if every manifest parsed
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Total number of manifest files found
    pub fn total_found(&self) -> usize {
        self.manifests.len() + self.failures.len()
    }
}

/// Whether `path` names a plug manifest
pub fn is_manifest_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.len() > MANIFEST_SUFFIX.len() && name.ends_with(MANIFEST_SUFFIX))
        .unwrap_or(false)
}

/// Read and parse one manifest file
pub fn read_manifest(path: &Path) -> Result<Manifest, DiscoveryError> {
    let content = std::fs::read_to_string(path).map_err(|source| DiscoveryError::ReadManifest {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| DiscoveryError::ParseManifest {
        path: path.to_path_buf(),
        source,
    })
}

/// Plug directory scanner
#[derive(Debug, Default, Clone, Copy)]
pub struct ManifestScanner;

impl ManifestScanner {
    pub fn new() -> Self {
        Self
    }

    /// Scan a directory for manifest files
    ///
    /// Results are sorted by path so loading order is stable.
    pub fn scan_directory(&self, dir: impl AsRef<Path>) -> Result<DiscoveryResult, DiscoveryError> {
        let dir = dir.as_ref();

        if !dir.is_dir() {
            return Err(DiscoveryError::DirectoryNotFound(dir.to_path_buf()));
        }

        let entries = std::fs::read_dir(dir).map_err(DiscoveryError::ReadDirectory)?;

        let mut paths = Vec::new();
        let mut result = DiscoveryResult::default();

        for entry in entries {
            match entry {
                Ok(entry) => {
                    let path = entry.path();
                    if path.is_file() && is_manifest_path(&path) {
                        paths.push(path);
                    }
                }
                Err(e) => result
                    .failures
                    .push((dir.to_path_buf(), DiscoveryError::ReadDirectory(e))),
            }
        }
        paths.sort();

        for path in paths {
            match read_manifest(&path) {
                Ok(manifest) => result.manifests.push(DiscoveredManifest { path, manifest }),
                Err(e) => result.failures.push((path, e)),
            }
        }

        Ok(result)
    }

    /// Scan multiple directories
    ///
    /// Missing directories are recorded as failures, not errors.
    pub fn scan_directories(&self, dirs: impl IntoIterator<Item = impl AsRef<Path>>) -> DiscoveryResult {
        let mut all = DiscoveryResult::default();

        for dir in dirs {
            let dir = dir.as_ref();
            match self.scan_directory(dir) {
                Ok(result) => {
                    all.manifests.extend(result.manifests);
                    all.failures.extend(result.failures);
                }
                Err(e) => all.failures.push((dir.to_path_buf(), e)),
            }
        }

        all
    }
}

/// Get default plug directories for the current platform
pub fn default_plug_dirs(app_name: &str) -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    // User-local plugs
    if let Some(data_dir) = dirs::data_local_dir() {
        dirs.push(data_dir.join(app_name).join("plugs"));
    }

    // Current directory plugs
    dirs.push(PathBuf::from("plugs"));

    dirs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_scan_empty_directory() {
        let temp = TempDir::new().unwrap();
        let result = ManifestScanner::new().scan_directory(temp.path()).unwrap();

        assert!(result.manifests.is_empty());
        assert!(result.is_success());
    }

    #[test]
    fn test_scan_nonexistent_directory() {
        let result = ManifestScanner::new().scan_directory("/nonexistent/path/to/plugs");
        assert!(matches!(result, Err(DiscoveryError::DirectoryNotFound(_))));
    }

    #[test]
    fn test_scan_manifests() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join("b.plug.json"),
            r#"{"name": "beta", "functions": {"run": {"code": "(module)"}}}"#,
        )
        .unwrap();
        fs::write(temp.path().join("a.plug.json"), r#"{"name": "alpha"}"#).unwrap();
        fs::write(temp.path().join("broken.plug.json"), "{ nope").unwrap();
        fs::write(temp.path().join("readme.txt"), "Hello").unwrap();
        fs::write(temp.path().join("config.json"), "{}").unwrap();

        let result = ManifestScanner::new().scan_directory(temp.path()).unwrap();

        let names: Vec<&str> = result.manifests.iter().map(|m| m.manifest.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
        assert_eq!(result.failures.len(), 1);
        assert!(matches!(result.failures[0].1, DiscoveryError::ParseManifest { .. }));
        assert_eq!(result.total_found(), 3);
    }

    #[test]
    fn test_scan_directories_records_missing() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.plug.json"), r#"{"name": "alpha"}"#).unwrap();

        let result = ManifestScanner::new().scan_directories([temp.path(), Path::new("/nonexistent/plugs")]);
        assert_eq!(result.manifests.len(), 1);
        assert_eq!(result.failures.len(), 1);
    }

    #[test]
    fn test_is_manifest_path() {
        assert!(is_manifest_path(Path::new("/x/notes.plug.json")));
        assert!(!is_manifest_path(Path::new("/x/.plug.json")));
        assert!(!is_manifest_path(Path::new("/x/notes.json")));
    }

    #[test]
    fn test_default_plug_dirs() {
        let dirs = default_plug_dirs("myapp");
        assert!(!dirs.is_empty());
        assert!(dirs.iter().any(|d| d.ends_with("plugs")));
    }
}
