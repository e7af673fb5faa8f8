use std::path::PathBuf;

use tracing::debug;

use crate::models::task::ImageTask;
use crate::services::ocr::{OcrServiceClient, ServiceError};
use crate::services::writer::{ResultWriter, WriteError};

/// Upload → classify (optional) → OCR → save → delete, for one image.
#[derive(Clone)]
pub struct Pipeline {
    ocr: OcrServiceClient,
    writer: ResultWriter,
    /// Fixed class id; `None` asks the service to classify each image.
    class_override: Option<i64>,
}

impl Pipeline {
    pub fn new(ocr: OcrServiceClient, writer: ResultWriter, class_override: Option<i64>) -> Self {
        Self {
            ocr,
            writer,
            class_override,
        }
    }

    /// Process one image. The source file is deleted only after its
    /// response file has been written.
    pub async fn process(&self, task: &ImageTask) -> Result<PathBuf, PipelineError> {
        let token = self.ocr.upload(&task.path).await?;
        debug!(image = %task.name, token = %token, "Uploaded");

        let class_id = match self.class_override {
            Some(id) => id,
            None => {
                let class = self.ocr.classify(&token).await?;
                debug!(image = %task.name, class_id = class.class_id, class_name = %class.class_name, "Classified");
                class.class_id
            }
        };

        let data = self.ocr.extract_ocr(&token, class_id).await?;
        let response_path = self.writer.write(&task.name, &data).await?;

        tokio::fs::remove_file(&task.path)
            .await
            .map_err(|source| PipelineError::Delete {
                path: task.path.clone(),
                source,
            })?;

        Ok(response_path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("Failed to save OCR results: {0}")]
    Write(#[from] WriteError),

    #[error("Failed to delete image {}: {source}", path.display())]
    Delete {
        path: PathBuf,
        source: std::io::Error,
    },
}
