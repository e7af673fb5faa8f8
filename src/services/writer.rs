//! Response sidecar files.
//!
//! Each processed image gets `<response_dir>/<stem>.txt` containing the
//! original image name, a space, the OCR items as a 4-space indented JSON
//! array, and a trailing newline.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use tracing::warn;

use crate::models::envelope::OcrData;
use crate::models::ocr::{OcrItem, RawValue};
use crate::models::task::file_stem;

/// Outcome of flattening an OCR response into items.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub items: Vec<OcrItem>,
    /// Bounding-box entries dropped because they were malformed.
    pub skipped: usize,
    /// Set when the box list ran past the text list and was cut short.
    pub truncated: bool,
}

/// Flatten `result_bbox` into items, validating every element.
///
/// Malformed entries are skipped one by one; iteration stops at the end of
/// `result_ocr_text` so the two arrays are never read out of step.
pub fn normalize(image_name: &str, data: &OcrData) -> Normalized {
    let mut items = Vec::with_capacity(data.result_bbox.len());
    let mut skipped = 0;
    let mut truncated = false;

    for (index, entry) in data.result_bbox.iter().enumerate() {
        if index >= data.result_ocr_text.len() {
            warn!(
                image = image_name,
                index,
                texts = data.result_ocr_text.len(),
                boxes = data.result_bbox.len(),
                "Mismatch between OCR text and bounding boxes"
            );
            truncated = true;
            break;
        }

        match parse_entry(entry) {
            Ok(item) => items.push(item),
            Err(reason) => {
                warn!(image = image_name, index, reason, "Skipping malformed bounding box");
                skipped += 1;
            }
        }
    }

    Normalized {
        items,
        skipped,
        truncated,
    }
}

fn parse_entry(entry: &RawValue) -> Result<OcrItem, &'static str> {
    let parts = entry.as_array().ok_or("entry is not an array")?;
    let [points_raw, text_raw, ..] = parts else {
        return Err("entry has fewer than two elements");
    };

    let points = points_raw
        .as_array()
        .ok_or("points are not an array")?
        .iter()
        .map(parse_point)
        .collect::<Result<Vec<_>, _>>()?;

    let text_info = text_raw.as_array().ok_or("text info is not an array")?;
    let [text, confidence, ..] = text_info else {
        return Err("text info has fewer than two elements");
    };
    let text = text.as_str().ok_or("text is not a string")?;
    let confidence = confidence.as_f64().ok_or("confidence is not a number")?;

    Ok(OcrItem {
        text: text.to_string(),
        confidence,
        points,
    })
}

fn parse_point(raw: &RawValue) -> Result<[f64; 2], &'static str> {
    match raw.as_array() {
        Some([x, y]) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => Ok([x, y]),
            _ => Err("coordinate is not a number"),
        },
        _ => Err("point is not an [x, y] pair"),
    }
}

/// Render the file content for `image_name`.
pub fn render(image_name: &str, items: &[OcrItem]) -> Result<String, WriteError> {
    let mut json = Vec::new();
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut json, PrettyFormatter::with_indent(b"    "));
    items.serialize(&mut serializer)?;
    let json = String::from_utf8(json).map_err(|e| WriteError::Encoding(e.to_string()))?;
    Ok(format!("{image_name} {json}\n"))
}

/// Writes response files into one directory.
#[derive(Debug, Clone)]
pub struct ResultWriter {
    response_dir: PathBuf,
}

impl ResultWriter {
    pub fn new(response_dir: impl Into<PathBuf>) -> Self {
        Self {
            response_dir: response_dir.into(),
        }
    }

    pub fn response_path(&self, image_name: &str) -> PathBuf {
        self.response_dir.join(format!("{}.txt", file_stem(image_name)))
    }

    /// Normalize `data` and write the response file, returning its path.
    pub async fn write(&self, image_name: &str, data: &OcrData) -> Result<PathBuf, WriteError> {
        let normalized = normalize(image_name, data);
        let content = render(image_name, &normalized.items)?;
        let path = self.response_path(image_name);

        tokio::fs::write(&path, content)
            .await
            .map_err(|source| WriteError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }
}

/// A response file read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFile {
    pub image_name: String,
    pub items: Vec<OcrItem>,
}

/// Parse a response file: `<image name> <item array>`. The name may itself
/// contain `" ["`, so each such boundary is tried until the rest parses.
pub async fn read_response_file(path: &Path) -> Result<ResponseFile, ReadError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ReadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    parse_response(&content).map_err(|reason| ReadError::Format {
        path: path.to_path_buf(),
        reason,
    })
}

fn parse_response(content: &str) -> Result<ResponseFile, String> {
    let mut last_error = "no JSON array found".to_string();
    for (split, _) in content.match_indices(" [") {
        match serde_json::from_str(&content[split + 1..]) {
            Ok(items) => {
                return Ok(ResponseFile {
                    image_name: content[..split].to_string(),
                    items,
                })
            }
            Err(e) => last_error = e.to_string(),
        }
    }
    Err(last_error)
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("Failed to serialize OCR items: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Serialized OCR items are not UTF-8: {0}")]
    Encoding(String),

    #[error("Failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed response file {}: {reason}", path.display())]
    Format { path: PathBuf, reason: String },
}
