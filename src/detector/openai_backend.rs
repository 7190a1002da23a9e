//! OpenAI-compatible detector backend
//!
//! Talks to any server exposing `/v1/chat/completions` (mlx_lm.server,
//! llama.cpp, vLLM, LM Studio). Models are loaded by the server on first
//! use, so admission sends a one-token warmup request to surface download
//! and load failures before any document is scored.
//!
//! Documents are sent as text. Rasterization and OCR happen upstream.

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

use super::traits::{
    measure_async, CandidateModels, Categorization, Detector, ExtractedFields, ModelHost,
};
use crate::config::{DocumentType, InferenceSection};

/// Characters of document text sent per request
const MAX_DOCUMENT_CHARS: usize = 12_000;

/// Upper bound for a single HTTP exchange, includes first-use model load
const REQUEST_TIMEOUT_SECS: u64 = 900;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Thin chat-completions client
#[derive(Clone)]
struct ChatClient {
    http: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl ChatClient {
    async fn complete(&self, model: &str, prompt: &str, max_tokens: u32) -> Result<String> {
        let url = format!("{}/chat/completions", self.endpoint.trim_end_matches('/'));
        let body = ChatRequest {
            model,
            messages: vec![ChatMessage { role: "user", content: prompt }],
            temperature: 0.0,
            max_tokens,
        };

        let mut request = self.http.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?
            .error_for_status()
            .with_context(|| format!("Inference server rejected request for {}", model))?
            .json::<ChatResponse>()
            .await
            .context("Failed to decode chat completion")?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("Empty completion from {}", model))
    }
}

/// Model host backed by an OpenAI-compatible inference server
pub struct OpenAiHost {
    chat: ChatClient,
}

impl OpenAiHost {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            chat: ChatClient {
                http,
                endpoint: endpoint.into(),
                api_key,
            },
        })
    }

    pub fn from_config(section: &InferenceSection) -> Result<Self> {
        let api_key = section
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.trim().is_empty());
        Self::new(section.endpoint.clone(), api_key)
    }
}

#[async_trait::async_trait]
impl ModelHost for OpenAiHost {
    async fn admit(&self, candidate: &CandidateModels) -> Result<Box<dyn Detector>> {
        tracing::info!("Loading {}", candidate.label());

        let detector = OpenAiDetector {
            chat: self.chat.clone(),
            name: candidate.label(),
            categorizer: candidate.categorizer.clone(),
            extractor: candidate
                .extractor
                .clone()
                .unwrap_or_else(|| candidate.categorizer.clone()),
        };

        let (warm, load_duration) = measure_async(detector.warmup()).await;
        warm.with_context(|| format!("Failed to load {}", candidate.label()))?;

        tracing::info!("{} loaded in {:?}", candidate.label(), load_duration);
        Ok(Box::new(detector))
    }

    async fn release(&self, detector: Box<dyn Detector>) {
        // The server evicts idle models itself; dropping ends our use of it
        tracing::info!("Releasing {}", detector.name());
        drop(detector);
    }
}

/// Detector that prompts a categorizer and an extractor model
pub struct OpenAiDetector {
    chat: ChatClient,
    name: String,
    categorizer: String,
    extractor: String,
}

impl OpenAiDetector {
    async fn warmup(&self) -> Result<()> {
        self.chat.complete(&self.categorizer, "ping", 1).await?;
        if self.extractor != self.categorizer {
            self.chat.complete(&self.extractor, "ping", 1).await?;
        }
        Ok(())
    }

    async fn model_check(&self, text: &str, document_type: DocumentType) -> Result<bool> {
        let prompt = format!(
            "You classify scanned documents.\n\
             Target type: {}.\n\
             Answer with JSON only: {{\"match\": true}} if the document is of the target type, \
             otherwise {{\"match\": false}}.\n\nDocument:\n{}",
            document_type.description(),
            text
        );
        let reply = self.chat.complete(&self.categorizer, &prompt, 16).await?;
        parse_match_reply(&reply)
            .with_context(|| format!("Unrecognized categorization reply: {:?}", reply))
    }
}

#[async_trait::async_trait]
impl Detector for OpenAiDetector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn categorize(&self, document: &Path, document_type: DocumentType) -> Result<Categorization> {
        let text = read_document(document).await?;

        // Both checks always complete before a decision
        let (model_match, confidence) = tokio::join!(
            self.model_check(&text, document_type),
            async { keyword_confidence(&text, document_type) }
        );

        Ok(Categorization {
            is_match: model_match?,
            confidence,
        })
    }

    async fn extract_fields(&self, document: &Path, document_type: DocumentType) -> Result<ExtractedFields> {
        let text = read_document(document).await?;
        let secondary = document_type.secondary_field();
        let prompt = format!(
            "Extract fields from this {}.\n\
             Answer with JSON only, using null for anything absent:\n\
             {{\"date\": \"YYYY-MM-DD\", \"{}\": \"...\", \"patient\": \"full name\"}}\n\nDocument:\n{}",
            document_type.name(),
            secondary,
            text
        );
        let reply = self.chat.complete(&self.extractor, &prompt, 256).await?;
        let object = parse_json_object(&reply)
            .with_context(|| format!("Extraction reply is not a JSON object: {:?}", reply))?;

        Ok(ExtractedFields {
            date: field_value(&object, "date"),
            secondary_field: field_value(&object, secondary),
            patient_field: field_value(&object, "patient"),
        })
    }
}

async fn read_document(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read document: {:?}", path))?;
    Ok(String::from_utf8_lossy(&bytes)
        .chars()
        .take(MAX_DOCUMENT_CHARS)
        .collect())
}

/// Share of the type's keywords present in the text
fn keyword_confidence(text: &str, document_type: DocumentType) -> f32 {
    let lower = text.to_lowercase();
    let keywords = document_type.keywords();
    let hits = keywords.iter().filter(|kw| lower.contains(*kw)).count();
    hits as f32 / keywords.len().max(1) as f32
}

/// First `{ ... }` span of a reply, tolerating code fences and chatter
fn parse_json_object(reply: &str) -> Option<serde_json::Map<String, Value>> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end < start {
        return None;
    }
    match serde_json::from_str::<Value>(&reply[start..=end]).ok()? {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

fn parse_match_reply(reply: &str) -> Option<bool> {
    if let Some(object) = parse_json_object(reply) {
        return object.get("match").and_then(Value::as_bool);
    }
    let word = reply.trim().to_lowercase();
    if word.starts_with("yes") || word.starts_with("true") {
        Some(true)
    } else if word.starts_with("no") || word.starts_with("false") {
        Some(false)
    } else {
        None
    }
}

fn field_value(object: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    match object.get(key)? {
        Value::String(s) if !s.trim().is_empty() && !s.eq_ignore_ascii_case("null") => {
            Some(s.trim().to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
