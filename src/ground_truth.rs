//! Ground truth sidecar files
//!
//! Every corpus document has a JSON sidecar next to it (`<file name>.groundtruth.json`)
//! holding the expected outcome. Sidecars are generated once with the currently
//! configured models, reviewed by a human (who sets `verified`), and then only
//! read during benchmark passes.
//!
//! ## Sidecar Format
//!
//! ```json
//! {
//!   "date": "2025-06-27",
//!   "documentType": "invoice",
//!   "isMatch": true,
//!   "metadata": {
//!     "generatedAt": "2025-06-28T09:12:44Z",
//!     "generatorModelIds": ["mlx-community/Qwen2.5-VL-7B-Instruct-4bit"],
//!     "verified": false
//!   },
//!   "patientField": "Jane Doe",
//!   "secondaryField": "120.50"
//! }
//! ```
//!
//! Keys are written in sorted order so reviewed files diff cleanly.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::config::DocumentType;

/// Suffix appended to a document's file name to locate its sidecar
pub const SIDECAR_SUFFIX: &str = ".groundtruth.json";

/// Expected outcome for one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundTruth {
    pub is_match: bool,
    pub document_type: DocumentType,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub secondary_field: Option<String>,
    #[serde(default)]
    pub patient_field: Option<String>,
    pub metadata: GroundTruthMetadata,
}

/// Provenance of a ground truth record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundTruthMetadata {
    pub generator_model_ids: Vec<String>,
    #[serde(with = "rfc3339_seconds")]
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub verified: bool,
}

impl GroundTruth {
    /// Record for a document that must not match (nothing to extract)
    pub fn negative(document_type: DocumentType, generator_model_ids: Vec<String>) -> Self {
        Self {
            is_match: false,
            document_type,
            date: None,
            secondary_field: None,
            patient_field: None,
            metadata: GroundTruthMetadata::unverified(generator_model_ids),
        }
    }
}

impl GroundTruthMetadata {
    pub fn unverified(generator_model_ids: Vec<String>) -> Self {
        Self {
            generator_model_ids,
            generated_at: Utc::now(),
            verified: false,
        }
    }
}

/// Sidecar path for a document
pub fn sidecar_path(document: &Path) -> PathBuf {
    let mut name = document
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(SIDECAR_SUFFIX);
    document.with_file_name(name)
}

/// Check whether a path is itself a sidecar file
pub fn is_sidecar(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(SIDECAR_SUFFIX))
}

/// Load the sidecar for a document, `None` when it does not exist
pub fn load(document: &Path) -> Result<Option<GroundTruth>> {
    let path = sidecar_path(document);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read ground truth: {:?}", path))?;
    let truth = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse ground truth: {:?}", path))?;
    Ok(Some(truth))
}

/// Write the sidecar for a document with sorted keys, returns the sidecar path
pub fn save(document: &Path, truth: &GroundTruth) -> Result<PathBuf> {
    let path = sidecar_path(document);
    // serde_json::Value keeps object keys in a BTreeMap
    let value = serde_json::to_value(truth)?;
    let mut json = serde_json::to_string_pretty(&value)?;
    json.push('\n');
    std::fs::write(&path, json)
        .with_context(|| format!("Failed to write ground truth: {:?}", path))?;
    Ok(path)
}

/// Load sidecars for every document, failing on the first missing one
pub fn load_all(documents: &[PathBuf]) -> Result<Vec<GroundTruth>> {
    let mut truths = Vec::with_capacity(documents.len());
    let mut missing = Vec::new();
    for document in documents {
        match load(document)? {
            Some(truth) => truths.push(truth),
            None => missing.push(document),
        }
    }
    if let Some(first) = missing.first() {
        anyhow::bail!(
            "Missing ground truth for {} of {} documents (first: {:?}). Run `ground-truth` to generate it.",
            missing.len(),
            documents.len(),
            first
        );
    }
    Ok(truths)
}

mod rfc3339_seconds {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> GroundTruth {
        GroundTruth {
            is_match: true,
            document_type: DocumentType::Invoice,
            date: Some("2025-06-27".to_string()),
            secondary_field: Some("120.50".to_string()),
            patient_field: Some("Jane Doe".to_string()),
            metadata: GroundTruthMetadata::unverified(vec!["org/model-7b".to_string()]),
        }
    }

    #[test]
    fn test_sidecar_path() {
        let path = sidecar_path(Path::new("/corpus/positive/scan 01.pdf"));
        assert_eq!(path, PathBuf::from("/corpus/positive/scan 01.pdf.groundtruth.json"));
        assert!(is_sidecar(&path));
        assert!(!is_sidecar(Path::new("/corpus/positive/scan 01.pdf")));
    }

    #[test]
    fn test_save_writes_sorted_keys() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("a.pdf");
        let path = save(&doc, &sample()).unwrap();

        let json = std::fs::read_to_string(path).unwrap();
        let date = json.find("\"date\"").unwrap();
        let doc_type = json.find("\"documentType\"").unwrap();
        let is_match = json.find("\"isMatch\"").unwrap();
        let metadata = json.find("\"metadata\"").unwrap();
        assert!(date < doc_type && doc_type < is_match && is_match < metadata);
        assert!(json.ends_with("}\n"));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("a.pdf");
        let truth = sample();
        save(&doc, &truth).unwrap();

        let loaded = load(&doc).unwrap().unwrap();
        assert_eq!(loaded.secondary_field, truth.secondary_field);
        assert_eq!(loaded.metadata.generated_at.timestamp(), truth.metadata.generated_at.timestamp());
        assert!(!loaded.metadata.verified);
    }

    #[test]
    fn test_load_hand_edited_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let doc = dir.path().join("b.png");
        std::fs::write(
            sidecar_path(&doc),
            r#"{
  "documentType": "prescription",
  "isMatch": false,
  "metadata": {
    "generatedAt": "2025-06-28T09:12:44Z",
    "generatorModelIds": [],
    "verified": true
  }
}"#,
        )
        .unwrap();

        let truth = load(&doc).unwrap().unwrap();
        assert!(!truth.is_match);
        assert_eq!(truth.document_type, DocumentType::Prescription);
        assert!(truth.date.is_none());
        assert!(truth.metadata.verified);
    }

    #[test]
    fn test_load_all_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present.pdf");
        let absent = dir.path().join("absent.pdf");
        save(&present, &sample()).unwrap();

        assert_eq!(load_all(&[present.clone()]).unwrap().len(), 1);
        let err = load_all(&[present, absent]).unwrap_err().to_string();
        assert!(err.contains("1 of 2"), "{err}");
        assert!(err.contains("absent.pdf"), "{err}");
    }
}
