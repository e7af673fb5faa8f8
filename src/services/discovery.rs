use std::path::{Path, PathBuf};

use tracing::warn;

use crate::models::task::ImageTask;

/// Extensions accepted as images, compared case-insensitively.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "gif", "tiff"];

pub fn is_image_file(name: &str) -> bool {
    Path::new(name)
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// List the images directly inside `dir`, sorted by file name.
///
/// Subdirectories are not descended into.
pub async fn discover_images(dir: &Path) -> Result<Vec<ImageTask>, DiscoveryError> {
    let read_error = |source| DiscoveryError::ReadDir {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = tokio::fs::read_dir(dir).await.map_err(read_error)?;
    let mut paths: Vec<PathBuf> = Vec::new();

    while let Some(entry) = entries.next_entry().await.map_err(read_error)? {
        let path = entry.path();
        // Symlinks are not followed, so a dangling link is just another entry.
        let file_type = match entry.file_type().await {
            Ok(file_type) => file_type,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable directory entry");
                continue;
            }
        };
        if file_type.is_dir() {
            continue;
        }
        if is_image_file(&entry.file_name().to_string_lossy()) {
            paths.push(path);
        }
    }

    paths.sort();
    Ok(paths.into_iter().map(ImageTask::new).collect())
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Failed to read image directory {}: {source}", path.display())]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
}
