//! Document model benchmark library
//!
//! Evaluates categorizer/extractor model candidates against a labeled
//! document corpus and ranks them by accuracy and latency.

pub mod benchmark;
pub mod cleanup;
pub mod config;
pub mod detector;
pub mod discovery;
pub mod ground_truth;
pub mod resources;
pub mod worker;
