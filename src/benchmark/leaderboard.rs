//! Benchmark results and ranking
//!
//! Qualified candidates are ranked by total score (descending), ties broken
//! by elapsed time (ascending), then by evaluation order. Disqualified
//! candidates follow in evaluation order with their reason.

use serde::Serialize;
use std::time::Duration;

use crate::detector::{CandidateModels, ExtractedFields};
use crate::resources::format_bytes;

/// Outcome for one document under one candidate
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentResult {
    pub filename: String,
    pub is_positive_sample: bool,
    pub predicted_is_match: bool,
    pub categorization_correct: bool,
    /// Only true when categorization is correct
    pub extraction_correct: bool,
    pub score: u32,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicted: Option<ExtractedFields>,
}

impl DocumentResult {
    /// Lost points this document could have earned
    pub fn is_miss(&self) -> bool {
        !self.categorization_correct
            || self.timed_out
            || self.error.is_some()
            || (self.predicted.is_some() && !self.extraction_correct)
    }
}

/// Aggregate for one candidate
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateResult {
    pub model_identifiers: Vec<String>,
    pub gated: bool,
    pub documents: Vec<DocumentResult>,
    pub total_score: u32,
    pub max_score: u32,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    pub is_disqualified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disqualification_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_memory_mb: Option<f64>,
}

impl CandidateResult {
    pub fn new(candidate: &CandidateModels, max_score: u32) -> Self {
        Self {
            model_identifiers: candidate.identifiers().into_iter().map(String::from).collect(),
            gated: candidate.gated,
            documents: Vec::new(),
            total_score: 0,
            max_score,
            elapsed: Duration::ZERO,
            is_disqualified: false,
            disqualification_reason: None,
            peak_memory_mb: None,
        }
    }

    pub fn label(&self) -> String {
        self.model_identifiers.join(" + ")
    }

    pub fn push(&mut self, document: DocumentResult) {
        self.total_score += document.score;
        self.documents.push(document);
    }

    /// Terminal for the run; documents already scored are kept
    pub fn disqualify(&mut self, reason: impl Into<String>) {
        self.is_disqualified = true;
        self.disqualification_reason = Some(reason.into());
    }

    pub fn ratio(&self) -> f64 {
        if self.max_score == 0 {
            0.0
        } else {
            self.total_score as f64 / self.max_score as f64
        }
    }
}

fn serialize_secs<S: serde::Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(value.as_secs_f64())
}

/// Ranked results of a run
#[derive(Debug, Clone, Default, Serialize)]
pub struct Leaderboard {
    pub ranked: Vec<CandidateResult>,
    pub disqualified: Vec<CandidateResult>,
}

impl Leaderboard {
    /// Rank results given in evaluation order
    pub fn rank(results: Vec<CandidateResult>) -> Self {
        let (mut ranked, disqualified): (Vec<_>, Vec<_>) =
            results.into_iter().partition(|r| !r.is_disqualified);

        // Stable sort keeps evaluation order for full ties
        ranked.sort_by(|a, b| {
            b.total_score
                .cmp(&a.total_score)
                .then_with(|| a.elapsed.cmp(&b.elapsed))
        });

        Self {
            ranked,
            disqualified,
        }
    }

    pub fn winner(&self) -> Option<&CandidateResult> {
        self.ranked.first()
    }

    pub fn len(&self) -> usize {
        self.ranked.len() + self.disqualified.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every model identifier that took part in the run
    pub fn used_models(&self) -> Vec<String> {
        self.ranked
            .iter()
            .chain(&self.disqualified)
            .flat_map(|r| r.model_identifiers.iter().cloned())
            .collect()
    }

    pub fn print(&self) {
        println!("\n╔══════════════════════════════════════════════════════════════════════════╗");
        println!("║                          BENCHMARK LEADERBOARD                           ║");
        println!("╚══════════════════════════════════════════════════════════════════════════╝\n");

        println!(
            "{:<4} {:<44} {:>7} {:>7} {:>9} {:>10}",
            "#", "Candidate", "Score", "Ratio", "Elapsed", "Peak Mem"
        );
        println!("{}", "─".repeat(86));

        for (idx, result) in self.ranked.iter().enumerate() {
            println!(
                "{:<4} {:<44} {:>7} {:>6.1}% {:>8.1}s {:>10}",
                idx + 1,
                truncate(&display_label(result), 44),
                format!("{}/{}", result.total_score, result.max_score),
                result.ratio() * 100.0,
                result.elapsed.as_secs_f64(),
                peak_memory(result),
            );
        }

        if !self.disqualified.is_empty() {
            println!("\n┌─ DISQUALIFIED ──────────────────────────────────────────────────────────┐");
            for result in &self.disqualified {
                println!(
                    "  ✗ {} ({}/{} before disqualification)",
                    display_label(result),
                    result.total_score,
                    result.max_score
                );
                if let Some(reason) = &result.disqualification_reason {
                    println!("      {}", reason);
                }
            }
            println!("└─────────────────────────────────────────────────────────────────────────┘");
        }

        match self.winner() {
            Some(winner) => println!(
                "\n  Winner: {} ({:.1}%)",
                winner.label(),
                winner.ratio() * 100.0
            ),
            None => println!("\n  No candidate qualified."),
        }
    }

    /// Per-document breakdown, misses only
    pub fn print_misses(&self) {
        for result in self.ranked.iter().chain(&self.disqualified) {
            let misses: Vec<_> = result.documents.iter().filter(|d| d.is_miss()).collect();
            if misses.is_empty() {
                continue;
            }
            println!("\n  {}:", result.label());
            for doc in misses {
                let note = if doc.timed_out {
                    "timed out".to_string()
                } else if let Some(error) = &doc.error {
                    error.clone()
                } else if !doc.categorization_correct {
                    format!("predicted match={}", doc.predicted_is_match)
                } else {
                    "extraction mismatch".to_string()
                };
                println!("    - {} [{}] {}", doc.filename, doc.score, note);
            }
        }
    }
}

fn display_label(result: &CandidateResult) -> String {
    if result.gated {
        format!("{} (gated)", result.label())
    } else {
        result.label()
    }
}

fn peak_memory(result: &CandidateResult) -> String {
    match result.peak_memory_mb {
        Some(mb) => format_bytes((mb * 1024.0 * 1024.0) as u64),
        None => "-".to_string(),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let kept: String = text.chars().take(max - 1).collect();
        format!("{}…", kept)
    }
}
