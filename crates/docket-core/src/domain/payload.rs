//! Typed task payloads.
//!
//! One variant per job kind. The serialized form is internally tagged by
//! `task_type`, so a stored payload is self-describing.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task_type", rename_all = "snake_case")]
pub enum TaskPayload {
    /// Run text extraction over an uploaded document.
    OcrProcessing { filename: String, file_path: PathBuf },

    /// Normalize already extracted text of a single page.
    TextNormalization { page_number: u32, text: String },
}

impl TaskPayload {
    pub fn ocr(filename: impl Into<String>, file_path: impl Into<PathBuf>) -> Self {
        TaskPayload::OcrProcessing {
            filename: filename.into(),
            file_path: file_path.into(),
        }
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::OcrProcessing { .. } => TaskKind::OcrProcessing,
            TaskPayload::TextNormalization { .. } => TaskKind::TextNormalization,
        }
    }
}

/// Discriminator of [`TaskPayload`], used to route a task to its processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    OcrProcessing,
    TextNormalization,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::OcrProcessing => "ocr_processing",
            TaskKind::TextNormalization => "text_normalization",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_is_tagged_by_task_type() {
        let payload = TaskPayload::ocr("contract.pdf", "/uploads/doc-1/contract.pdf");
        let value = serde_json::to_value(&payload).unwrap();

        assert_eq!(
            value,
            json!({
                "task_type": "ocr_processing",
                "filename": "contract.pdf",
                "file_path": "/uploads/doc-1/contract.pdf",
            })
        );
        assert_eq!(value["task_type"], payload.kind().as_str());
    }

    #[test]
    fn unknown_task_type_is_rejected() {
        let err = serde_json::from_value::<TaskPayload>(json!({ "task_type": "thumbnail" }));
        assert!(err.is_err());
    }
}
