use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use super::ocr::RawValue;

/// Common wrapper returned by every endpoint of the OCR service.
///
/// `data` stays untyped until the envelope is known to be successful, since
/// failed calls carry `null`, `{}` or partial objects there.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    pub is_success: bool,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: serde_json::Value,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    /// Decode `data` into the endpoint's payload type. `None` when absent.
    pub fn into_data<T: DeserializeOwned>(self) -> Option<Result<T, serde_json::Error>> {
        if self.data.is_null() {
            return None;
        }
        Some(serde_json::from_value(self.data))
    }
}

/// `data` of a successful upload.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadData {
    /// Opaque token referencing the uploaded file on the service side.
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClassificationData {
    #[serde(rename = "ocr_id")]
    pub class_id: i64,
    #[serde(rename = "ocr_name", default)]
    pub class_name: String,
}

/// `data` of a successful OCR call.
///
/// The text and bounding-box arrays are kept loosely typed; the result
/// writer validates each element before using it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OcrData {
    #[serde(default)]
    pub ocr_id: Option<i64>,
    #[serde(default)]
    pub ocr_name: Option<String>,
    #[serde(default)]
    pub result_file_name: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub result_ocr_text: Vec<RawValue>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub result_bbox: Vec<RawValue>,
}

#[derive(Debug, Serialize)]
pub struct ClassificationRequest<'a> {
    pub file_name: &'a str,
}

/// The service expects `ocr_id` as a decimal string.
#[derive(Debug, Serialize)]
pub struct OcrRequest<'a> {
    pub file_name: &'a str,
    pub ocr_id: String,
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}
