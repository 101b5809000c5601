//! Filesystem-backed directory transfer collaborators.
//!
//! Default implementations of [`DirectoryUploadProvider`] and
//! [`DirectoryDownloadReceiver`] rooted at a local directory. The receiver
//! validates every relative path it is given; paths from the wire are
//! untrusted and must not be able to escape the target root.

use crate::channel::api::{
    DirectoryDownloadReceiver, DirectoryUploadContext, DirectoryUploadProvider, FileDataSource,
};
use crate::error::{Result, UplinkError};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

// =============================================================================
// Path validation
// =============================================================================

/// Validates an untrusted relative path and resolves it under `root`.
/// Rejects absolute paths, parent-directory components and anything that
/// would normalize to a location outside the root.
fn validate_path(root: &Path, relative: &str) -> Result<PathBuf> {
    if relative.is_empty() {
        return Err(UplinkError::protocol("empty relative path not allowed"));
    }

    let rel_path = Path::new(relative);
    if rel_path.is_absolute() {
        return Err(UplinkError::protocol(format!(
            "absolute path not allowed: {relative}"
        )));
    }

    for component in rel_path.components() {
        match component {
            Component::ParentDir => {
                return Err(UplinkError::protocol(format!(
                    "path traversal not allowed: {relative}"
                )));
            }
            Component::Prefix(_) => {
                return Err(UplinkError::protocol(format!(
                    "windows prefix paths not allowed: {relative}"
                )));
            }
            _ => {}
        }
    }

    // Normalize and re-check, which catches forms like "foo/../bar".
    let full = root.join(rel_path);
    let normalized = normalize_path(&full);
    let root_normalized = normalize_path(root);
    if !normalized.starts_with(&root_normalized) {
        return Err(UplinkError::protocol(format!(
            "path escapes target root: {relative}"
        )));
    }
    Ok(full)
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            c => normalized.push(c),
        }
    }
    normalized
}

// =============================================================================
// Upload provider
// =============================================================================

/// Uploads the contents of a local directory tree. The listing contains
/// the relative paths of all subdirectories, so empty directories survive
/// the transfer.
pub struct FsDirectoryUploadProvider {
    root: PathBuf,
}

impl FsDirectoryUploadProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Walks the tree iteratively; `tokio::fs` has no recursive read_dir.
    async fn collect_entries(&self) -> Result<(Vec<String>, Vec<PathBuf>)> {
        let mut directories = Vec::new();
        let mut files = Vec::new();
        let mut queue = vec![self.root.clone()];
        while let Some(dir) = queue.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    directories.push(self.relative_of(&path)?);
                    queue.push(path);
                } else if file_type.is_file() {
                    files.push(path);
                }
                // Symlinks and special files are skipped.
            }
        }
        directories.sort();
        files.sort();
        Ok((directories, files))
    }

    fn relative_of(&self, path: &Path) -> Result<String> {
        let relative = path.strip_prefix(&self.root).map_err(|_| {
            UplinkError::protocol(format!("entry outside upload root: {}", path.display()))
        })?;
        // Forward slashes on the wire, independent of the local platform.
        Ok(relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"))
    }
}

#[async_trait]
impl DirectoryUploadProvider for FsDirectoryUploadProvider {
    async fn provide_directory_listing(&self) -> Result<Option<Vec<String>>> {
        let (directories, _) = self.collect_entries().await?;
        Ok(Some(directories))
    }

    async fn provide_files(&self, context: &dyn DirectoryUploadContext) -> Result<()> {
        let (_, files) = self.collect_entries().await?;
        for path in files {
            let relative = self.relative_of(&path)?;
            let metadata = tokio::fs::metadata(&path).await?;
            let file = tokio::fs::File::open(&path).await?;
            context
                .provide_file(FileDataSource::new(relative, metadata.len(), Box::new(file)))
                .await?;
        }
        Ok(())
    }
}

// =============================================================================
// Download receiver
// =============================================================================

/// Writes a received directory transfer below a local root directory.
pub struct FsDirectoryDownloadReceiver {
    root: PathBuf,
}

impl FsDirectoryDownloadReceiver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl DirectoryDownloadReceiver for FsDirectoryDownloadReceiver {
    async fn receive_directory_listing(&self, relative_paths: Vec<String>) -> Result<()> {
        for relative in relative_paths {
            let path = validate_path(&self.root, &relative)?;
            tokio::fs::create_dir_all(&path).await?;
        }
        Ok(())
    }

    async fn receive_file(&self, mut file: FileDataSource) -> Result<()> {
        let path = validate_path(&self.root, file.relative_path())?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        debug!(path = %path.display(), size = file.size(), "Writing received file");
        let mut target = tokio::fs::File::create(&path).await?;
        tokio::io::copy(&mut file, &mut target).await?;
        target.sync_all().await?;
        Ok(())
    }
}
