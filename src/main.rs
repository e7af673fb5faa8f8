use std::fs::{File, OpenOptions};
use std::path::Path;
use std::time::Duration;

use clc_ocr_batch::{
    config::{AppConfig, RunMode},
    pipeline::Pipeline,
    scheduler::{BatchScheduler, ClientSource},
    services::{
        discovery::discover_images,
        identity::{discover_data_dirs, TorLauncher},
        ocr::OcrServiceClient,
        writer::ResultWriter,
    },
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() {
    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    let _log_guard = match init_logging(&config.log_file) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Cannot open log file {}: {e}", config.log_file.display());
            return;
        }
    };

    tracing::info!(mode = %config.mode, source_dir = %config.source_dir.display(), "Starting OCR batch run");

    if let Err(e) = tokio::fs::create_dir_all(&config.response_dir).await {
        tracing::error!(error = %e, "Failed to create response directory");
        return;
    }

    let tasks = match discover_images(&config.source_dir).await {
        Ok(tasks) => tasks,
        Err(e) => {
            tracing::error!(error = %e, "Image discovery failed");
            return;
        }
    };
    tracing::info!(images = tasks.len(), "Discovered images");

    let source = match config.mode {
        RunMode::Rotating => {
            let data_dirs = match discover_data_dirs(Path::new("."), &config.tor_data_dir_prefix).await {
                Ok(dirs) => dirs,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to list data directories");
                    return;
                }
            };
            let launcher = TorLauncher::new(
                &config.tor_binary,
                Duration::from_secs(config.tor_bootstrap_timeout_secs),
            );
            ClientSource::Rotating {
                provider: launcher,
                data_dirs,
            }
        }
        RunMode::Cooldown => ClientSource::Fixed(reqwest::Client::new()),
    };

    let mut scheduler = match BatchScheduler::new(config.schedule(), source) {
        Ok(scheduler) => scheduler,
        Err(e) => {
            tracing::error!(error = %e, "Cannot start scheduler");
            return;
        }
    };

    let writer = ResultWriter::new(&config.response_dir);
    let retry = config.ocr_retry();
    let class_override = config.class_override();
    let base_url = config.base_url.clone();

    let summary = scheduler
        .run(tasks, move |http, task| {
            let ocr = OcrServiceClient::new(http, base_url.clone(), retry.clone());
            let pipeline = Pipeline::new(ocr, writer.clone(), class_override);
            async move { pipeline.process(&task).await }
        })
        .await;

    tracing::info!(
        batches = summary.batches,
        succeeded = summary.succeeded,
        failed = summary.failed,
        skipped = summary.skipped,
        rotations = summary.rotations,
        "OCR batch run finished"
    );
}

fn open_log_file(log_file: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(log_file)
}

/// JSON lines on stdout plus a plain, timestamped append-only log file.
///
/// The returned guard flushes the file writer when dropped.
fn init_logging(log_file: &Path) -> std::io::Result<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_writer, guard) = tracing_appender::non_blocking(open_log_file(log_file)?);

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_timer(ChronoLocal::new("%Y/%m/%d %H:%M:%S".to_string()))
        .with_target(false)
        .with_ansi(false);

    let console_layer = fmt::layer().json().with_writer(std::io::stdout);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}
