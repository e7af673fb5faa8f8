//! CLC Sino-Nom OCR batch uploader
//!
//! Uploads local images to the CLC Sino-Nom OCR web service in small
//! concurrent batches, optionally behind a rotating Tor circuit, and stores
//! each result as a JSON sidecar file next to the run.

pub mod config;
pub mod models;
pub mod pipeline;
pub mod scheduler;
pub mod services;
