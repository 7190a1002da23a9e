//! Detector and model host abstractions
//!
//! The benchmark never looks inside categorization or extraction. It only
//! needs a [`Detector`] that answers "is this document of the target type?"
//! and "which fields does it carry?", and a [`ModelHost`] that loads and
//! releases the models behind a detector.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::config::DocumentType;

/// Result of categorizing one document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Categorization {
    pub is_match: bool,
    /// Confidence signal in [0, 1], informational only
    pub confidence: f32,
}

/// Fields extracted from a matching document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedFields {
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub secondary_field: Option<String>,
    #[serde(default)]
    pub patient_field: Option<String>,
}

/// The model, or model pair, evaluated as one candidate
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandidateModels {
    pub categorizer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extractor: Option<String>,
    /// At least one model needs registry approval before download
    #[serde(default)]
    pub gated: bool,
}

impl CandidateModels {
    pub fn categorizer_only(categorizer: impl Into<String>) -> Self {
        Self {
            categorizer: categorizer.into(),
            extractor: None,
            gated: false,
        }
    }

    pub fn pair(categorizer: impl Into<String>, extractor: impl Into<String>) -> Self {
        Self {
            categorizer: categorizer.into(),
            extractor: Some(extractor.into()),
            gated: false,
        }
    }

    /// All model identifiers, categorizer first
    pub fn identifiers(&self) -> Vec<&str> {
        let mut ids = vec![self.categorizer.as_str()];
        if let Some(extractor) = &self.extractor {
            ids.push(extractor.as_str());
        }
        ids
    }

    /// Human-readable label used in logs and the leaderboard
    pub fn label(&self) -> String {
        match &self.extractor {
            Some(extractor) => format!("{} + {}", self.categorizer, extractor),
            None => self.categorizer.clone(),
        }
    }
}

/// Categorizes documents and extracts their fields
///
/// Implementations hold loaded models. Dropping a detector does not release
/// anything on its own; hand it back to its [`ModelHost`].
#[async_trait::async_trait]
pub trait Detector: Send + Sync {
    /// Name of the loaded configuration
    fn name(&self) -> &str;

    /// Decide whether a document is of the target type
    async fn categorize(&self, document: &Path, document_type: DocumentType) -> Result<Categorization>;

    /// Extract the date, secondary and patient fields
    async fn extract_fields(&self, document: &Path, document_type: DocumentType) -> Result<ExtractedFields>;
}

/// Owns the load/release lifecycle of candidate models
///
/// At most one detector obtained from [`ModelHost::admit`] is alive at a
/// time; callers release it before admitting the next candidate.
#[async_trait::async_trait]
pub trait ModelHost: Send + Sync {
    /// Load the candidate's models and return a ready detector
    async fn admit(&self, candidate: &CandidateModels) -> Result<Box<dyn Detector>>;

    /// Unload the models behind a detector
    async fn release(&self, detector: Box<dyn Detector>);
}

/// Helper to measure duration of an async operation
pub async fn measure_async<F, T>(f: F) -> (T, Duration)
where
    F: std::future::Future<Output = T>,
{
    let start = std::time::Instant::now();
    let result = f.await;
    let duration = start.elapsed();
    (result, duration)
}
