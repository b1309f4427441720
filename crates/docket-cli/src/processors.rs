//! Processors wired into the `docket` binary.

use std::collections::HashMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use docket_core::domain::{ProcessError, Task, TaskId, TaskPayload};
use docket_core::ports::Processor;
use docket_core::resilience::{BreakerConfig, CircuitBreaker, with_timeout};
use docket_core::worker::ProgressReporter;
use tracing::info;

/// Upper bound on reading one document from storage.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Extraction front half: verifies the uploaded file is readable and
/// reports extraction progress. Reads run behind a breaker, so only a
/// document that exists counts toward opening it.
pub struct OcrProcessor {
    storage: CircuitBreaker,
}

impl OcrProcessor {
    pub fn new(breaker: BreakerConfig) -> Self {
        Self {
            storage: CircuitBreaker::new("document-storage", breaker),
        }
    }
}

#[async_trait]
impl Processor for OcrProcessor {
    async fn process(&self, task: &Task, progress: &ProgressReporter) -> Result<(), ProcessError> {
        let TaskPayload::OcrProcessing { filename, file_path } = &task.payload else {
            return Err(ProcessError::permanent("expected an ocr_processing payload"));
        };

        if !tokio::fs::try_exists(file_path).await.unwrap_or(false) {
            return Err(ProcessError::permanent(format!(
                "file not found: {}",
                file_path.display()
            )));
        }
        progress.report(20, "starting extraction").await;

        let bytes = self
            .storage
            .call(move || async move {
                with_timeout(READ_TIMEOUT, read_document(file_path))
                    .await
                    .map_err(ProcessError::from)
                    .and_then(|read| read)
            })
            .await?;

        progress.report(50, "document loaded").await;
        let pages = count_pages(&bytes);
        progress.report(80, "text extracted").await;
        progress.report(90, "finalizing").await;

        info!(%filename, bytes = bytes.len(), pages, "document processed");
        Ok(())
    }
}

async fn read_document(path: &Path) -> Result<Vec<u8>, ProcessError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == IoErrorKind::NotFound => Err(ProcessError::permanent(format!(
            "file not found: {}",
            path.display()
        ))),
        Err(e) if e.kind() == IoErrorKind::PermissionDenied => Err(ProcessError::permanent(
            format!("file not readable: {}: {e}", path.display()),
        )),
        Err(e) => Err(ProcessError::transient(format!(
            "reading {}: {e}",
            path.display()
        ))),
    }
}

/// Form feeds separate pages in plain-text exports.
fn count_pages(bytes: &[u8]) -> usize {
    bytes.iter().filter(|b| **b == b'\x0c').count() + 1
}

/// Collapses whitespace runs in one page of extracted text.
pub struct NormalizeProcessor;

#[async_trait]
impl Processor for NormalizeProcessor {
    async fn process(&self, task: &Task, progress: &ProgressReporter) -> Result<(), ProcessError> {
        let TaskPayload::TextNormalization { page_number, text } = &task.payload else {
            return Err(ProcessError::permanent("expected a text_normalization payload"));
        };

        let normalized = normalize(text);
        progress.report(50, "text normalized").await;
        info!(page_number, before = text.len(), after = normalized.len(), "page normalized");
        Ok(())
    }
}

pub fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fails the first `failures` attempts of every task, then succeeds.
pub struct FlakyProcessor {
    failures: u32,
    seen: Mutex<HashMap<TaskId, u32>>,
}

impl FlakyProcessor {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            seen: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Processor for FlakyProcessor {
    async fn process(&self, task: &Task, progress: &ProgressReporter) -> Result<(), ProcessError> {
        let attempt = {
            let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
            let n = seen.entry(task.id.clone()).or_insert(0);
            *n += 1;
            *n
        };

        progress.report(30, "working").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        if attempt <= self.failures {
            return Err(ProcessError::transient(format!("simulated failure #{attempt}")));
        }
        Ok(())
    }
}
