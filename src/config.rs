//! Configuration for the document benchmark
//!
//! Defines the `benchmark.toml` schema, the document types that can be
//! benchmarked, the evaluation mode and the allowed inference timeouts.
//! Registry tokens are kept in a [`SecretStore`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides any stored registry token
pub const TOKEN_ENV_VAR: &str = "HF_TOKEN";

/// Document type targeted by a benchmark run
///
/// Only one type is benchmarked per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentType {
    /// Invoices and bills, secondary field is the total amount
    Invoice,
    /// Prescriptions, secondary field is the prescribing doctor
    Prescription,
    /// Laboratory reports, secondary field is the laboratory name
    LabReport,
}

impl DocumentType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Invoice => "invoice",
            Self::Prescription => "prescription",
            Self::LabReport => "lab-report",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "invoice" | "bill" | "invoices" => Some(Self::Invoice),
            "prescription" | "rx" | "prescriptions" => Some(Self::Prescription),
            "lab-report" | "lab" | "labreport" => Some(Self::LabReport),
            _ => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Invoice => "Invoice or bill issued for a medical service",
            Self::Prescription => "Medication prescription signed by a doctor",
            Self::LabReport => "Laboratory test results report",
        }
    }

    /// Label of the type-specific secondary field
    pub fn secondary_field(&self) -> &'static str {
        match self {
            Self::Invoice => "amount",
            Self::Prescription => "doctor",
            Self::LabReport => "laboratory",
        }
    }

    /// Keywords used by the rule-based categorization check
    pub fn keywords(&self) -> &'static [&'static str] {
        match self {
            Self::Invoice => &["invoice", "amount due", "total", "bill", "payment"],
            Self::Prescription => &["prescription", "rx", "dosage", "tablets", "refill"],
            Self::LabReport => &["laboratory", "specimen", "reference range", "result", "lab"],
        }
    }

    pub fn all() -> Vec<Self> {
        vec![Self::Invoice, Self::Prescription, Self::LabReport]
    }
}

/// What a benchmark run evaluates
///
/// - `Categorizer`: categorization only, one point per document
/// - `Combined`: categorization plus field extraction, two points per document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationMode {
    #[default]
    Categorizer,
    Combined,
}

impl EvaluationMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Categorizer => "categorizer",
            Self::Combined => "combined",
        }
    }

    /// Highest score a single document can contribute
    pub fn max_score_per_document(&self) -> u32 {
        match self {
            Self::Categorizer => 1,
            Self::Combined => 2,
        }
    }
}

/// Per-document inference timeout, restricted to a fixed set of values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InferenceTimeout {
    #[serde(rename = "10")]
    Short,
    #[default]
    #[serde(rename = "30")]
    Medium,
    #[serde(rename = "60")]
    Long,
}

impl InferenceTimeout {
    pub fn secs(&self) -> u64 {
        match self {
            Self::Short => 10,
            Self::Medium => 30,
            Self::Long => 60,
        }
    }

    pub fn from_secs(secs: u64) -> Option<Self> {
        match secs {
            10 => Some(Self::Short),
            30 => Some(Self::Medium),
            60 => Some(Self::Long),
            _ => None,
        }
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.secs())
    }
}

/// Benchmark configuration loaded from TOML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    #[serde(default)]
    pub models: ModelsSection,

    #[serde(default)]
    pub inference: InferenceSection,

    #[serde(default)]
    pub registry: RegistrySection,

    #[serde(default)]
    pub cache: CacheSection,
}

impl BenchmarkConfig {
    /// Load config from TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read benchmark config: {:?}", path))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse benchmark config: {:?}", path))?;
        Ok(config)
    }

    /// Load from default location (./benchmark.toml) or return defaults
    pub fn load_default() -> Result<Self> {
        let local_path = Path::new("benchmark.toml");
        if local_path.exists() {
            return Self::load(local_path);
        }
        Ok(Self::default())
    }

    /// Model identifiers that are part of the current setup and must survive cleanup
    pub fn configured_models(&self) -> Vec<String> {
        let mut models = vec![self.models.categorizer.clone()];
        if let Some(extractor) = &self.models.extractor {
            models.push(extractor.clone());
        }
        models
    }
}

/// Currently configured models plus the candidates to benchmark
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsSection {
    /// Categorizer used in production and for ground-truth generation
    pub categorizer: String,

    /// Extractor used in production and for ground-truth generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extractor: Option<String>,

    /// Categorizer candidates, concrete ("org/name") or family ("qwen2.5-vl")
    #[serde(default)]
    pub categorizer_candidates: Vec<String>,

    /// Extractor candidates, concrete or family
    #[serde(default)]
    pub extractor_candidates: Vec<String>,
}

impl Default for ModelsSection {
    fn default() -> Self {
        Self {
            categorizer: "mlx-community/Qwen2.5-VL-7B-Instruct-4bit".to_string(),
            extractor: Some("mlx-community/Qwen2.5-7B-Instruct-4bit".to_string()),
            categorizer_candidates: vec![],
            extractor_candidates: vec![],
        }
    }
}

/// Inference server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceSection {
    /// Base URL of an OpenAI-compatible server
    #[serde(default = "default_inference_endpoint")]
    pub endpoint: String,

    /// Environment variable holding the inference API key, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Wall-clock allowance for model download and load in worker runs
    #[serde(default = "default_load_allowance")]
    pub load_allowance_secs: u64,

    /// Time between graceful termination and forced kill of a worker
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
}

impl Default for InferenceSection {
    fn default() -> Self {
        Self {
            endpoint: default_inference_endpoint(),
            api_key_env: None,
            load_allowance_secs: default_load_allowance(),
            grace_period_secs: default_grace_period(),
        }
    }
}

/// Model registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySection {
    #[serde(default = "default_registry_endpoint")]
    pub endpoint: String,

    /// Account whose token is looked up in the secret store
    #[serde(default = "default_account")]
    pub account: String,

    /// Candidates taken from each family search
    #[serde(default = "default_discovery_limit")]
    pub discovery_limit: usize,

    /// Drop gated models from discovered candidate lists
    #[serde(default = "default_true")]
    pub skip_gated: bool,

    /// Capability tag required for categorizer candidates
    #[serde(default = "default_categorizer_filter")]
    pub categorizer_filter: String,

    /// Capability tag required for extractor candidates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extractor_filter: Option<String>,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            endpoint: default_registry_endpoint(),
            account: default_account(),
            discovery_limit: default_discovery_limit(),
            skip_gated: true,
            categorizer_filter: default_categorizer_filter(),
            extractor_filter: None,
        }
    }
}

/// Local model cache settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSection {
    /// Model cache root, defaults to the Hugging Face hub cache
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl CacheSection {
    pub fn resolve_dir(&self) -> Option<PathBuf> {
        self.dir.clone().or_else(|| {
            dirs::home_dir().map(|h| h.join(".cache").join("huggingface").join("hub"))
        })
    }
}

fn default_inference_endpoint() -> String { "http://127.0.0.1:8080/v1".to_string() }
fn default_load_allowance() -> u64 { 600 }
fn default_grace_period() -> u64 { 5 }
fn default_registry_endpoint() -> String { "https://huggingface.co".to_string() }
fn default_account() -> String { "default".to_string() }
fn default_discovery_limit() -> usize { 5 }
fn default_categorizer_filter() -> String { "image-text-to-text".to_string() }
fn default_true() -> bool { true }

/// Key-value store for registry tokens, keyed by account
pub trait SecretStore {
    fn get_token(&self, account: &str) -> Result<Option<String>>;
    fn set_token(&self, account: &str, token: &str) -> Result<()>;
}

/// Secret store backed by a JSON file in the user config directory
pub struct FileSecretStore {
    path: PathBuf,
}

impl FileSecretStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Store at `<config dir>/document-benchmark/credentials.json`
    pub fn default_location() -> Result<Self> {
        let dir = dirs::config_dir().context("No user config directory available")?;
        Ok(Self::new(dir.join("document-benchmark").join("credentials.json")))
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read credentials: {:?}", self.path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse credentials: {:?}", self.path))
    }
}

impl SecretStore for FileSecretStore {
    fn get_token(&self, account: &str) -> Result<Option<String>> {
        Ok(self.read_all()?.remove(account))
    }

    fn set_token(&self, account: &str, token: &str) -> Result<()> {
        let mut all = self.read_all()?;
        all.insert(account.to_string(), token.to_string());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&all)?)
            .with_context(|| format!("Failed to write credentials: {:?}", self.path))?;
        Ok(())
    }
}

/// Resolve the registry token: environment first, then the secret store
pub fn resolve_token(store: &dyn SecretStore, account: &str) -> Result<Option<String>> {
    if let Ok(token) = std::env::var(TOKEN_ENV_VAR) {
        if !token.trim().is_empty() {
            return Ok(Some(token));
        }
    }
    store.get_token(account)
}
