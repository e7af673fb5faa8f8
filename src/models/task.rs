use std::path::{Path, PathBuf};

/// An image waiting to be sent through the OCR pipeline.
///
/// Created during directory discovery and consumed once; on success the
/// source file is deleted, on failure it stays put for the next run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTask {
    pub path: PathBuf,
    /// Base file name, e.g. `page_3.jpg`.
    pub name: String,
}

impl ImageTask {
    pub fn new(path: PathBuf) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { path, name }
    }

    /// File name without its extension, used for the response file name.
    pub fn stem(&self) -> String {
        file_stem(&self.name)
    }
}

pub(crate) fn file_stem(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}
