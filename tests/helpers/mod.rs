//! Stub of the CLC OCR web service for integration tests

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use clc_ocr_batch::services::ocr::{CLASSIFY_PATH, OCR_PATH, UPLOAD_PATH};

/// Class id the stub classifier assigns to every image.
pub const STUB_CLASS_ID: i64 = 3;

/// How a failing OCR call is answered.
#[derive(Debug, Clone, Copy, Default)]
pub enum OcrFailure {
    /// HTTP 503 with a plain-text body.
    #[default]
    Unavailable,
    /// HTTP 200 with an `is_success: false` envelope.
    Rejected,
    /// HTTP 200 with a body that is not JSON.
    Garbled,
}

#[derive(Default)]
struct StubInner {
    /// Upload file names answered with `is_success: false`.
    reject_uploads: HashSet<String>,
    ocr_failures_left: AtomicUsize,
    ocr_failure: OcrFailure,
    uploads: Mutex<Vec<String>>,
    classify_calls: AtomicUsize,
    ocr_requests: Mutex<Vec<Value>>,
}

#[derive(Clone)]
pub struct StubService {
    pub base_url: String,
    inner: Arc<StubInner>,
}

impl StubService {
    /// Start the stub on an ephemeral local port. The first `ocr_failures`
    /// OCR calls answer 503.
    pub async fn start(reject_uploads: &[&str], ocr_failures: usize) -> Self {
        Self::start_with(reject_uploads, ocr_failures, OcrFailure::Unavailable).await
    }

    /// Like [`StubService::start`], failing OCR calls the given way.
    pub async fn start_with(
        reject_uploads: &[&str],
        ocr_failures: usize,
        ocr_failure: OcrFailure,
    ) -> Self {
        let inner = Arc::new(StubInner {
            reject_uploads: reject_uploads.iter().map(|s| s.to_string()).collect(),
            ocr_failures_left: AtomicUsize::new(ocr_failures),
            ocr_failure,
            ..StubInner::default()
        });

        let app = Router::new()
            .route(UPLOAD_PATH, post(upload))
            .route(CLASSIFY_PATH, post(classify))
            .route(OCR_PATH, post(ocr))
            .with_state(inner.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            inner,
        }
    }

    pub fn uploads(&self) -> Vec<String> {
        self.inner.uploads.lock().unwrap().clone()
    }

    pub fn classify_calls(&self) -> usize {
        self.inner.classify_calls.load(Ordering::SeqCst)
    }

    pub fn ocr_requests(&self) -> Vec<Value> {
        self.inner.ocr_requests.lock().unwrap().clone()
    }
}

async fn upload(State(inner): State<Arc<StubInner>>, mut multipart: Multipart) -> Json<Value> {
    let mut file_name = None;
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() == Some("image_file") {
            file_name = field.file_name().map(str::to_string);
            let _ = field.bytes().await;
        }
    }

    let Some(file_name) = file_name else {
        return Json(json!({"is_success": false, "code": "E_NO_FILE", "message": "missing image_file"}));
    };
    inner.uploads.lock().unwrap().push(file_name.clone());

    if inner.reject_uploads.contains(&file_name) {
        return Json(json!({
            "is_success": false,
            "code": "E_UPLOAD",
            "message": "rejected",
            "data": {}
        }));
    }

    Json(json!({
        "is_success": true,
        "code": "200",
        "message": null,
        "data": {"file_name": format!("tok-{file_name}")}
    }))
}

async fn classify(State(inner): State<Arc<StubInner>>, Json(_body): Json<Value>) -> Json<Value> {
    inner.classify_calls.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "is_success": true,
        "code": "200",
        "message": null,
        "data": {"ocr_id": STUB_CLASS_ID, "ocr_name": "Han Nom"}
    }))
}

async fn ocr(State(inner): State<Arc<StubInner>>, Json(body): Json<Value>) -> Response {
    inner.ocr_requests.lock().unwrap().push(body);

    let failing = inner
        .ocr_failures_left
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        return match inner.ocr_failure {
            OcrFailure::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, "busy").into_response(),
            OcrFailure::Rejected => Json(json!({
                "is_success": false,
                "code": "E_OCR",
                "message": "recognition failed",
                "data": {}
            }))
            .into_response(),
            OcrFailure::Garbled => (StatusCode::OK, "<html>gateway hiccup</html>").into_response(),
        };
    }

    Json(json!({
        "is_success": true,
        "code": "200",
        "message": null,
        "data": {
            "ocr_id": 1,
            "ocr_name": "Han Nom",
            "result_file_name": "result.txt",
            "result_ocr_text": ["hello"],
            "result_bbox": [[[[0, 0], [1, 0], [1, 1], [0, 1]], ["hello", 0.95]]]
        }
    }))
    .into_response()
}
