//! Model validation and the best-effort type-detection heuristic (spec
//! §4.2). Both are pure functions over the filesystem — no cache state is
//! touched here.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    Safetensors,
    Ckpt,
    Pt,
    Onnx,
    Unknown,
}

impl ModelFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("safetensors") => ModelFormat::Safetensors,
            Some("ckpt") => ModelFormat::Ckpt,
            Some("pt") => ModelFormat::Pt,
            Some("onnx") => ModelFormat::Onnx,
            _ => ModelFormat::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Base,
    Refiner,
    Vae,
    ControlNet,
    Lora,
    Generic,
    Adapter,
}

const GB: u64 = 1024 * 1024 * 1024;
const MB: u64 = 1024 * 1024;

/// Best-effort size-based type classification (spec §4.2). Recorded
/// alongside the entry, never authoritative for correctness.
pub fn classify_by_size(size_bytes: u64) -> ModelType {
    if size_bytes >= 5 * GB {
        ModelType::Base
    } else if size_bytes >= 2 * GB {
        ModelType::Generic
    } else if size_bytes >= 500 * MB {
        ModelType::Vae
    } else if size_bytes >= 100 * MB {
        ModelType::Generic
    } else {
        ModelType::Adapter
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub path: String,
    pub exists: bool,
    pub size_bytes: Option<u64>,
    pub format: ModelFormat,
    pub heuristic_type: Option<ModelType>,
    pub warnings: Vec<String>,
}

/// Validates a set of candidate model paths, reporting existence, size,
/// detected format, and the heuristic type classification per path.
pub async fn validate_paths(paths: &[std::path::PathBuf]) -> Vec<ValidationReport> {
    let mut reports = Vec::with_capacity(paths.len());
    for path in paths {
        reports.push(validate_path(path).await);
    }
    reports
}

async fn validate_path(path: &Path) -> ValidationReport {
    let mut warnings = Vec::new();
    let format = ModelFormat::from_path(path);
    if format == ModelFormat::Unknown {
        warnings.push(format!(
            "unrecognized extension for {}; format detection defaulted to unknown",
            path.display()
        ));
    }

    let metadata = tokio::fs::metadata(path).await.ok();
    let exists = metadata.is_some();
    if !exists {
        warnings.push(format!("path does not exist: {}", path.display()));
    }

    let size_bytes = metadata.as_ref().map(|m| m.len());
    let heuristic_type = size_bytes.map(classify_by_size);

    ValidationReport {
        path: path.display().to_string(),
        exists,
        size_bytes,
        format,
        heuristic_type,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_size_thresholds() {
        assert_eq!(classify_by_size(6 * GB), ModelType::Base);
        assert_eq!(classify_by_size(3 * GB), ModelType::Generic);
        assert_eq!(classify_by_size(1 * GB), ModelType::Vae);
        assert_eq!(classify_by_size(200 * MB), ModelType::Generic);
        assert_eq!(classify_by_size(50 * MB), ModelType::Adapter);
    }

    #[tokio::test]
    async fn validate_reports_missing_path() {
        let reports = validate_paths(&[std::path::PathBuf::from("/nonexistent/model.safetensors")])
            .await;
        assert_eq!(reports.len(), 1);
        assert!(!reports[0].exists);
        assert_eq!(reports[0].format, ModelFormat::Safetensors);
        assert!(!reports[0].warnings.is_empty());
    }

    #[tokio::test]
    async fn validate_reports_existing_file_size_and_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.onnx");
        tokio::fs::write(&path, vec![0u8; 1024]).await.unwrap();

        let reports = validate_paths(&[path]).await;
        assert!(reports[0].exists);
        assert_eq!(reports[0].format, ModelFormat::Onnx);
        assert_eq!(reports[0].size_bytes, Some(1024));
    }
}
