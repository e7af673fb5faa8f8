use std::path::Path;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::models::envelope::{
    ClassificationData, ClassificationRequest, Envelope, OcrData, OcrRequest, UploadData,
};
use crate::services::retry::{retry_with_backoff, RetryPolicy};

pub const UPLOAD_PATH: &str = "/api/web/clc-sinonom/image-upload";
pub const CLASSIFY_PATH: &str = "/api/web/clc-sinonom/image-classification";
pub const OCR_PATH: &str = "/api/web/clc-sinonom/image-ocr";

/// Multipart field carrying the image bytes.
const UPLOAD_FIELD: &str = "image_file";

/// Client for the CLC Sino-Nom OCR web service.
///
/// Upload and classification fail fast; OCR extraction is retried with
/// exponential backoff.
#[derive(Clone)]
pub struct OcrServiceClient {
    http: Client,
    base_url: String,
    retry: RetryPolicy,
}

impl OcrServiceClient {
    pub fn new(http: Client, base_url: impl Into<String>, retry: RetryPolicy) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http,
            base_url,
            retry,
        }
    }

    /// Upload an image and return the service's file token.
    pub async fn upload(&self, image_path: &Path) -> Result<String, ServiceError> {
        self.upload_inner(image_path)
            .await
            .map_err(ServiceError::Upload)
    }

    async fn upload_inner(&self, image_path: &Path) -> Result<String, ApiError> {
        let bytes = tokio::fs::read(image_path).await?;
        let file_name = image_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("application/octet-stream")?;
        let form = Form::new().part(UPLOAD_FIELD, part);

        let response = self
            .http
            .post(self.url(UPLOAD_PATH))
            .multipart(form)
            .send()
            .await?;

        let data: UploadData = read_envelope(response).await?;
        Ok(data.file_name)
    }

    /// Ask the service which OCR model suits the uploaded image.
    pub async fn classify(&self, token: &str) -> Result<ClassificationData, ServiceError> {
        self.post_json(CLASSIFY_PATH, &ClassificationRequest { file_name: token })
            .await
            .map_err(ServiceError::Classification)
    }

    /// Run OCR on an uploaded image, retrying every kind of failure.
    pub async fn extract_ocr(&self, token: &str, class_id: i64) -> Result<OcrData, ServiceError> {
        let request = &OcrRequest {
            file_name: token,
            ocr_id: class_id.to_string(),
        };

        retry_with_backoff(&self.retry, "ocr", move |_| self.post_json(OCR_PATH, request))
            .await
            .map_err(|e| ServiceError::Ocr {
                attempts: e.attempts,
                source: e.last_error,
            })
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.http.post(self.url(path)).json(body).send().await?;
        read_envelope(response).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

async fn read_envelope<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        return Err(ApiError::Status { status, body });
    }

    let envelope: Envelope = serde_json::from_str(&body)?;
    if !envelope.is_success {
        return Err(ApiError::Rejected {
            code: envelope.code,
            message: envelope.message,
        });
    }

    envelope.into_data().ok_or(ApiError::MissingData)?.map_err(ApiError::Parse)
}

/// Cause of a failed call to the OCR service.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unable to read image file: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned {status}, body: {body}")]
    Status { status: StatusCode, body: String },

    #[error("Failed to parse JSON response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Service rejected the request with code {code}: {message}")]
    Rejected {
        code: String,
        message: serde_json::Value,
    },

    #[error("Successful response carried no data")]
    MissingData,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Upload failed: {0}")]
    Upload(#[source] ApiError),

    #[error("Classification failed: {0}")]
    Classification(#[source] ApiError),

    #[error("OCR failed after {attempts} attempts: {source}")]
    Ocr { attempts: u32, source: ApiError },
}
