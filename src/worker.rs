//! Isolated worker processes
//!
//! Each candidate can be evaluated in a fresh child process so that a crash
//! in the inference runtime only costs that candidate. Parent and child talk
//! through two temporary JSON files:
//!
//! ```text
//! parent                          child (`document-benchmark worker <in> <out>`)
//!   write WorkerInput  -> <in>
//!   spawn, arm watchdog            load models, evaluate documents
//!                                  write WorkerOutput -> <out>, exit 0
//!   classify exit, decode <out>
//!   delete <in> and <out>
//! ```
//!
//! The watchdog budget is `per-document timeout x documents + load allowance`.
//! When it expires the child gets SIGTERM, then SIGKILL after a grace period.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::{Child, Command};

use crate::config::DocumentType;
use crate::detector::{CandidateModels, Detector, ExtractedFields, ModelHost};
use crate::resources::ResourceMonitor;

/// Exit code of a worker whose models failed to load
pub const WORKER_EXIT_LOAD_FAILED: i32 = 3;

/// Default time between SIGTERM and SIGKILL
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Default allowance for model download and load
pub const DEFAULT_LOAD_ALLOWANCE: Duration = Duration::from_secs(600);

/// One document to evaluate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerDocument {
    pub path: PathBuf,
    pub is_positive: bool,
}

/// Parameters handed to a worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInput {
    pub candidate: CandidateModels,
    pub document_type: DocumentType,
    /// Run extraction on positive documents categorized as matching
    pub extract: bool,
    pub timeout_ms: u64,
    pub documents: Vec<WorkerDocument>,
}

impl WorkerInput {
    pub fn per_document_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Categorization of one document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategorizationOutcome {
    pub path: PathBuf,
    pub is_match: bool,
    pub confidence: f32,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Extraction of one document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionOutcome {
    #[serde(default)]
    pub fields: Option<ExtractedFields>,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Categorization plus extraction, if extraction was attempted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedOutcome {
    #[serde(flatten)]
    pub categorization: CategorizationOutcome,
    #[serde(default)]
    pub extraction: Option<ExtractionOutcome>,
}

impl CombinedOutcome {
    pub fn timed_out(&self) -> bool {
        self.categorization.timed_out || self.extraction.as_ref().is_some_and(|e| e.timed_out)
    }
}

/// Per-document results, exactly one kind per worker invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerResult {
    Categorization { documents: Vec<CategorizationOutcome> },
    Combined { documents: Vec<CombinedOutcome> },
}

impl WorkerResult {
    /// Normalize both kinds to combined outcomes
    pub fn into_outcomes(self) -> Vec<CombinedOutcome> {
        match self {
            Self::Categorization { documents } => documents
                .into_iter()
                .map(|categorization| CombinedOutcome {
                    categorization,
                    extraction: None,
                })
                .collect(),
            Self::Combined { documents } => documents,
        }
    }
}

/// Everything a worker reports back
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerOutput {
    /// Time spent on documents, excluding model load
    pub inference_secs: f64,
    pub result: WorkerResult,
}

/// Written in place of [`WorkerOutput`] before exiting with
/// [`WORKER_EXIT_LOAD_FAILED`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadFailure {
    pub reason: String,
}

/// How a worker invocation ended
#[derive(Debug)]
pub enum WorkerOutcome {
    Success(WorkerOutput),
    /// Exited with [`WORKER_EXIT_LOAD_FAILED`]; carries the reported cause
    LoadFailed(String),
    Crashed {
        exit_code: Option<i32>,
        signal: Option<i32>,
        /// The watchdog terminated the process
        watchdog_fired: bool,
    },
    DecodingFailed(String),
}

/// Result of [`WorkerRunner::run`]
#[derive(Debug)]
pub struct WorkerRun {
    pub outcome: WorkerOutcome,
    pub elapsed: Duration,
    pub budget: Duration,
    pub peak_memory_mb: Option<f64>,
}

/// Models could not be loaded inside a worker
#[derive(Debug, Error)]
#[error("Failed to load {model}: {reason}")]
pub struct LoadError {
    pub model: String,
    pub reason: String,
}

/// Launches worker processes and supervises them
#[derive(Debug, Clone)]
pub struct WorkerRunner {
    program: PathBuf,
    args: Vec<OsString>,
    load_allowance: Duration,
    grace_period: Duration,
    scratch_dir: Option<PathBuf>,
}

impl WorkerRunner {
    /// Run `program args... <input> <output>` for each invocation
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
            load_allowance: DEFAULT_LOAD_ALLOWANCE,
            grace_period: DEFAULT_GRACE_PERIOD,
            scratch_dir: None,
        }
    }

    /// Re-invoke the current executable with the given leading arguments
    pub fn current_exe(args: Vec<OsString>) -> Result<Self> {
        let program = std::env::current_exe().context("Failed to locate current executable")?;
        Ok(Self::new(program, args))
    }

    pub fn with_load_allowance(mut self, allowance: Duration) -> Self {
        self.load_allowance = allowance;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Directory for the temporary artifacts, defaults to the system temp dir
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    /// Wall-clock budget for one invocation
    pub fn budget(&self, input: &WorkerInput) -> Duration {
        input.per_document_timeout() * input.documents.len() as u32 + self.load_allowance
    }

    /// Run one worker to completion
    ///
    /// Errors are limited to failures before the child starts; everything
    /// after launch is reported through [`WorkerOutcome`].
    pub async fn run(&self, input: &WorkerInput) -> Result<WorkerRun> {
        let scratch = self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir);

        // Both artifacts are deleted when these guards drop, on every path
        let input_file = tempfile::Builder::new()
            .prefix("worker-input-")
            .suffix(".json")
            .tempfile_in(&scratch)
            .context("Failed to create worker input file")?;
        serde_json::to_writer(input_file.as_file(), input).context("Failed to write worker input")?;
        let input_path = input_file.into_temp_path();
        let output_path = tempfile::Builder::new()
            .prefix("worker-output-")
            .suffix(".json")
            .tempfile_in(&scratch)
            .context("Failed to create worker output file")?
            .into_temp_path();

        let budget = self.budget(input);
        let start = Instant::now();

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(&*input_path)
            .arg(&*output_path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to launch worker {:?}", self.program))?;

        tracing::debug!(
            "Worker {:?} started for {} (budget {:?})",
            child.id(),
            input.candidate.label(),
            budget
        );

        let monitor = child.id().map(ResourceMonitor::for_pid);
        let sampling = monitor.as_ref().map(|m| m.start_sampling());

        let (status, watchdog_fired) = match tokio::time::timeout(budget, child.wait()).await {
            Ok(status) => (status.context("Failed to wait for worker")?, false),
            Err(_) => {
                tracing::warn!(
                    "Worker for {} exceeded {:?}, terminating",
                    input.candidate.label(),
                    budget
                );
                let status = self
                    .terminate(&mut child)
                    .await
                    .context("Failed to terminate worker")?;
                (status, true)
            }
        };

        drop(sampling);
        let elapsed = start.elapsed();
        let outcome = classify(status, watchdog_fired, &output_path);

        Ok(WorkerRun {
            outcome,
            elapsed,
            budget,
            peak_memory_mb: monitor.and_then(|m| m.peak_memory_mb()),
        })
    }

    /// Graceful stop, then forced kill once the grace period runs out
    async fn terminate(&self, child: &mut Child) -> std::io::Result<ExitStatus> {
        request_stop(child);
        match tokio::time::timeout(self.grace_period, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                tracing::warn!("Worker ignored termination, killing");
                child.kill().await?;
                child.wait().await
            }
        }
    }
}

#[cfg(unix)]
fn request_stop(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: the pid belongs to our child, which has not been reaped yet
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn request_stop(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

fn classify(status: ExitStatus, watchdog_fired: bool, output_path: &Path) -> WorkerOutcome {
    if !watchdog_fired && status.code() == Some(WORKER_EXIT_LOAD_FAILED) {
        return WorkerOutcome::LoadFailed(load_failure_reason(output_path));
    }
    if watchdog_fired || !status.success() {
        return WorkerOutcome::Crashed {
            exit_code: status.code(),
            signal: exit_signal(&status),
            watchdog_fired,
        };
    }

    let content = match std::fs::read_to_string(output_path) {
        Ok(content) if !content.trim().is_empty() => content,
        Ok(_) => return WorkerOutcome::DecodingFailed("worker wrote no output".to_string()),
        Err(e) => return WorkerOutcome::DecodingFailed(format!("worker output unreadable: {}", e)),
    };

    match serde_json::from_str::<WorkerOutput>(&content) {
        Ok(output) => WorkerOutcome::Success(output),
        Err(e) => WorkerOutcome::DecodingFailed(format!("worker output invalid: {}", e)),
    }
}

fn load_failure_reason(output_path: &Path) -> String {
    let content = std::fs::read_to_string(output_path).unwrap_or_default();
    let content = content.trim();
    if content.is_empty() {
        return "no reason reported".to_string();
    }
    match serde_json::from_str::<LoadFailure>(content) {
        Ok(failure) => failure.reason,
        Err(_) => content.to_string(),
    }
}

/// Categorize one document and, when asked, extract its fields
///
/// Timeouts and detector errors are recorded in the outcome, never returned.
pub async fn evaluate_document(
    detector: &dyn Detector,
    document: &WorkerDocument,
    document_type: DocumentType,
    extract: bool,
    timeout: Duration,
) -> CombinedOutcome {
    // One deadline covers both calls for this document
    let deadline = tokio::time::Instant::now() + timeout;
    let path = document.path.clone();
    let mut categorization = CategorizationOutcome {
        path: path.clone(),
        is_match: false,
        confidence: 0.0,
        timed_out: false,
        error: None,
    };

    match tokio::time::timeout_at(deadline, detector.categorize(&path, document_type)).await {
        Ok(Ok(result)) => {
            categorization.is_match = result.is_match;
            categorization.confidence = result.confidence;
        }
        Ok(Err(e)) => categorization.error = Some(format!("{:#}", e)),
        Err(_) => categorization.timed_out = true,
    }

    let should_extract = extract && document.is_positive && categorization.is_match;
    let extraction = if should_extract {
        let mut outcome = ExtractionOutcome::default();
        match tokio::time::timeout_at(deadline, detector.extract_fields(&path, document_type)).await {
            Ok(Ok(fields)) => outcome.fields = Some(fields),
            Ok(Err(e)) => outcome.error = Some(format!("{:#}", e)),
            Err(_) => outcome.timed_out = true,
        }
        Some(outcome)
    } else {
        None
    };

    CombinedOutcome {
        categorization,
        extraction,
    }
}

/// Worker-side entry point: evaluate the input and write the output file
///
/// Stops at the first timed-out document; the parent disqualifies the
/// candidate on it anyway. Load failures are written to the output as a
/// [`LoadFailure`] and returned as [`LoadError`].
pub async fn serve(input_path: &Path, output_path: &Path, host: &dyn ModelHost) -> Result<()> {
    let content = std::fs::read_to_string(input_path)
        .with_context(|| format!("Failed to read worker input: {:?}", input_path))?;
    let input: WorkerInput =
        serde_json::from_str(&content).context("Failed to parse worker input")?;

    eprintln!("  [worker] loading {}", input.candidate.label());
    let detector = match host.admit(&input.candidate).await {
        Ok(detector) => detector,
        Err(e) => {
            let failure = LoadFailure {
                reason: format!("{:#}", e),
            };
            if let Err(write_err) = std::fs::write(output_path, serde_json::to_string(&failure)?) {
                tracing::warn!("Failed to record load failure in {:?}: {}", output_path, write_err);
            }
            return Err(LoadError {
                model: input.candidate.label(),
                reason: failure.reason,
            }
            .into());
        }
    };

    let start = Instant::now();
    let mut outcomes = Vec::with_capacity(input.documents.len());
    for (idx, document) in input.documents.iter().enumerate() {
        let outcome = evaluate_document(
            detector.as_ref(),
            document,
            input.document_type,
            input.extract,
            input.per_document_timeout(),
        )
        .await;
        eprintln!(
            "  [worker] {}/{} {}",
            idx + 1,
            input.documents.len(),
            document.path.display()
        );
        let timed_out = outcome.timed_out();
        outcomes.push(outcome);
        if timed_out {
            break;
        }
    }
    let inference_secs = start.elapsed().as_secs_f64();

    host.release(detector).await;

    let result = if input.extract {
        WorkerResult::Combined { documents: outcomes }
    } else {
        WorkerResult::Categorization {
            documents: outcomes.into_iter().map(|o| o.categorization).collect(),
        }
    };
    let output = WorkerOutput {
        inference_secs,
        result,
    };
    std::fs::write(output_path, serde_json::to_string(&output)?)
        .with_context(|| format!("Failed to write worker output: {:?}", output_path))?;
    Ok(())
}
