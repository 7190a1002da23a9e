//! Benchmark infrastructure
//!
//! ## Usage
//!
//! ```bash
//! document-benchmark run --positive ./corpus/invoices --negative ./corpus/other \
//!     --document-type invoice --timeout 30 --mode combined
//! ```
//!
//! ## Modules
//!
//! - `corpus` - positive/negative sample enumeration
//! - `scoring` - tolerant per-document scoring against ground truth
//! - `orchestrator` - phase sequencing, admission, per-candidate evaluation
//! - `leaderboard` - per-candidate results and ranking

pub mod corpus;
pub mod leaderboard;
pub mod orchestrator;
pub mod scoring;

pub use corpus::{load_corpus, Corpus, CorpusDocument};
pub use leaderboard::{CandidateResult, DocumentResult, Leaderboard};
pub use orchestrator::{
    AutoApprove, CandidateStep, Orchestrator, Phase, RunSettings, StdinGate, VerificationGate,
};
pub use scoring::{score_document, DocumentScore};
