//! Document detector abstraction
//!
//! Provides the collaborator interface the benchmark drives:
//! - `traits`: [`Detector`] and [`ModelHost`] plus shared result types
//! - `openai_backend`: detector over an OpenAI-compatible inference server

pub mod openai_backend;
pub mod traits;

pub use openai_backend::{OpenAiDetector, OpenAiHost};
pub use traits::{
    measure_async, CandidateModels, Categorization, Detector, ExtractedFields, ModelHost,
};
