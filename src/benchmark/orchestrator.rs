//! Benchmark orchestration
//!
//! Drives one benchmark run through its phases:
//!
//! ```text
//! Idle -> EnumeratingCorpus -> (GroundTruthReady | GeneratingGroundTruth -> GroundTruthReady)
//!      -> EvaluatingCandidate[0..n] -> Aggregating -> Done
//!
//! EvaluatingCandidate[i]:
//!   CheckingResources -> Loading -> RunningDocuments -> Releasing
//!          \               \              \
//!           `---------------`--------------`--> Disqualified
//! ```
//!
//! Candidates run strictly one after another. Exactly one model is resident
//! at any time: the previous candidate is released before the next one is
//! checked for admission, on failure paths too.
//!
//! ## Timeouts
//!
//! In-process, a document that exceeds the per-document timeout scores 0 and
//! the run moves on. With worker isolation, any timeout disqualifies the
//! whole candidate, since the parent cannot tell one slow document from a
//! stuck process.

use anyhow::{Context, Result};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::corpus::{load_corpus, Corpus, CorpusDocument};
use super::leaderboard::{CandidateResult, DocumentResult, Leaderboard};
use super::scoring::{score_document, DocumentScore};
use crate::config::{DocumentType, EvaluationMode};
use crate::detector::{CandidateModels, Detector, ModelHost};
use crate::ground_truth::{self, GroundTruth, GroundTruthMetadata};
use crate::resources::{self, Admission};
use crate::worker::{
    evaluate_document, CombinedOutcome, WorkerDocument, WorkerInput, WorkerOutcome, WorkerRunner,
};

/// Step within the evaluation of one candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateStep {
    CheckingResources,
    Loading,
    RunningDocuments,
    Releasing,
    Disqualified,
}

/// Phase of a benchmark run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    EnumeratingCorpus,
    GeneratingGroundTruth,
    GroundTruthReady,
    EvaluatingCandidate { index: usize, step: CandidateStep },
    Aggregating,
    Done,
}

impl Phase {
    /// Whether `next` may follow `self`
    pub fn can_transition_to(&self, next: &Phase) -> bool {
        use CandidateStep::*;
        use Phase::*;

        match (*self, *next) {
            (Idle, EnumeratingCorpus) => true,
            (EnumeratingCorpus, GroundTruthReady | GeneratingGroundTruth) => true,
            (GeneratingGroundTruth, GroundTruthReady) => true,
            (GroundTruthReady, EvaluatingCandidate { index: 0, step: CheckingResources }) => true,
            (GroundTruthReady, Aggregating) => true,
            (EvaluatingCandidate { index: i, step: a }, EvaluatingCandidate { index: j, step: b }) => {
                if i == j {
                    matches!(
                        (a, b),
                        (CheckingResources, Loading | Disqualified)
                            | (Loading, RunningDocuments | Disqualified)
                            | (RunningDocuments, Releasing | Disqualified)
                            | (Releasing, Disqualified)
                    )
                } else {
                    j == i + 1 && matches!(a, Releasing | Disqualified) && b == CheckingResources
                }
            }
            (EvaluatingCandidate { step: Releasing | Disqualified, .. }, Aggregating) => true,
            (Aggregating, Done) => true,
            _ => false,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Phase::Idle => "idle".to_string(),
            Phase::EnumeratingCorpus => "enumerating corpus".to_string(),
            Phase::GeneratingGroundTruth => "generating ground truth".to_string(),
            Phase::GroundTruthReady => "ground truth ready".to_string(),
            Phase::EvaluatingCandidate { index, step } => {
                format!("candidate {} ({:?})", index + 1, step)
            }
            Phase::Aggregating => "aggregating".to_string(),
            Phase::Done => "done".to_string(),
        }
    }
}

/// Human sign-off on freshly generated ground truth
pub trait VerificationGate {
    /// Return `false` to stop the run
    fn confirm(&self, written: &[PathBuf]) -> Result<bool>;
}

/// Waits for the operator on stdin
pub struct StdinGate;

impl VerificationGate for StdinGate {
    fn confirm(&self, written: &[PathBuf]) -> Result<bool> {
        eprintln!("\n┌─────────────────────────────────────────────────────────────┐");
        eprintln!("│                 GROUND TRUTH REVIEW REQUIRED                │");
        eprintln!("└─────────────────────────────────────────────────────────────┘\n");
        for path in written {
            eprintln!("  {}", path.display());
        }
        eprint!(
            "\nReview the files above, set \"verified\": true where correct,\n\
             then press Enter to continue (q to abort): "
        );
        std::io::stderr().flush()?;

        let mut answer = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut answer)
            .context("Failed to read confirmation")?;
        Ok(!answer.trim().eq_ignore_ascii_case("q"))
    }
}

/// Accepts generated ground truth without review
pub struct AutoApprove;

impl VerificationGate for AutoApprove {
    fn confirm(&self, _written: &[PathBuf]) -> Result<bool> {
        Ok(true)
    }
}

/// Settings shared by every candidate of a run
#[derive(Debug, Clone, Copy)]
pub struct RunSettings {
    pub document_type: DocumentType,
    pub mode: EvaluationMode,
    /// Per-document inference timeout
    pub timeout: Duration,
}

/// Sequences a benchmark run
pub struct Orchestrator<'a> {
    settings: RunSettings,
    host: &'a dyn ModelHost,
    runner: Option<WorkerRunner>,
    available_memory: u64,
    phase: Phase,
}

impl<'a> Orchestrator<'a> {
    pub fn new(settings: RunSettings, host: &'a dyn ModelHost) -> Self {
        Self {
            settings,
            host,
            runner: None,
            available_memory: resources::available_memory(),
            phase: Phase::Idle,
        }
    }

    /// Evaluate each candidate in its own worker process
    pub fn with_worker(mut self, runner: WorkerRunner) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Override the memory budget used for admission
    pub fn with_available_memory(mut self, bytes: u64) -> Self {
        self.available_memory = bytes;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn transition(&mut self, next: Phase) -> Result<()> {
        if !self.phase.can_transition_to(&next) {
            anyhow::bail!(
                "Illegal phase transition: {} -> {}",
                self.phase.name(),
                next.name()
            );
        }
        tracing::debug!("Phase: {} -> {}", self.phase.name(), next.name());
        self.phase = next;
        Ok(())
    }

    fn step(&mut self, index: usize, step: CandidateStep) -> Result<()> {
        self.transition(Phase::EvaluatingCandidate { index, step })
    }

    /// Enumerate positive and negative samples
    pub fn enumerate(&mut self, positive_dir: &Path, negative_dir: &Path) -> Result<Corpus> {
        self.transition(Phase::EnumeratingCorpus)?;
        let corpus = load_corpus(positive_dir, negative_dir)?;
        tracing::info!(
            "Corpus: {} positive, {} negative",
            corpus.positive_count(),
            corpus.negative_count()
        );
        Ok(corpus)
    }

    /// Load ground truth, generating missing records first
    ///
    /// With `regenerate`, every record is rebuilt. Fresh records pass the
    /// verification gate before they are used, then are read back from disk
    /// so reviewer edits take effect.
    pub async fn ground_truth(
        &mut self,
        corpus: &Corpus,
        generator: &CandidateModels,
        regenerate: bool,
        gate: &dyn VerificationGate,
    ) -> Result<Vec<GroundTruth>> {
        let mut missing = Vec::new();
        for document in &corpus.documents {
            if regenerate {
                missing.push(document);
                continue;
            }
            match ground_truth::load(&document.path)? {
                Some(truth) => self.check_document_type(&document.path, &truth)?,
                None => missing.push(document),
            }
        }

        if missing.is_empty() {
            self.transition(Phase::GroundTruthReady)?;
            return self.load_truths(corpus);
        }

        self.transition(Phase::GeneratingGroundTruth)?;
        eprintln!(
            "\nGenerating ground truth for {} documents with {}...",
            missing.len(),
            generator.label()
        );

        let written = self.generate(&missing, generator).await?;
        if !gate.confirm(&written)? {
            anyhow::bail!("Ground truth review aborted; rerun once the sidecars are verified");
        }

        self.transition(Phase::GroundTruthReady)?;
        self.load_truths(corpus)
    }

    async fn generate(&self, documents: &[&CorpusDocument], generator: &CandidateModels) -> Result<Vec<PathBuf>> {
        let generator_ids: Vec<String> = generator.identifiers().into_iter().map(String::from).collect();
        let document_type = self.settings.document_type;

        // Negatives need no model
        let needs_model = documents.iter().any(|d| d.is_positive);
        let detector = if needs_model {
            Some(
                self.host
                    .admit(generator)
                    .await
                    .context("Failed to load ground truth generator")?,
            )
        } else {
            None
        };

        let mut written = Vec::with_capacity(documents.len());
        let mut failure = None;
        for document in documents {
            let truth = match (&detector, document.is_positive) {
                (Some(detector), true) => {
                    self.generate_positive(detector.as_ref(), document, &generator_ids)
                        .await
                }
                _ => GroundTruth::negative(document_type, generator_ids.clone()),
            };
            match ground_truth::save(&document.path, &truth) {
                Ok(path) => written.push(path),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(detector) = detector {
            self.host.release(detector).await;
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    async fn generate_positive(
        &self,
        detector: &dyn Detector,
        document: &CorpusDocument,
        generator_ids: &[String],
    ) -> GroundTruth {
        let document_type = self.settings.document_type;
        let extraction = tokio::time::timeout(
            self.settings.timeout,
            detector.extract_fields(&document.path, document_type),
        )
        .await;

        let fields = match extraction {
            Ok(Ok(fields)) => fields,
            Ok(Err(e)) => {
                tracing::warn!("Extraction failed for {}: {:#}", document.filename(), e);
                Default::default()
            }
            Err(_) => {
                tracing::warn!("Extraction timed out for {}", document.filename());
                Default::default()
            }
        };
        eprintln!("  ✓ {}", document.filename());

        GroundTruth {
            is_match: true,
            document_type,
            date: fields.date,
            secondary_field: fields.secondary_field,
            patient_field: fields.patient_field,
            metadata: GroundTruthMetadata::unverified(generator_ids.to_vec()),
        }
    }

    /// Reject sidecars written for another document type
    fn check_document_type(&self, document: &Path, truth: &GroundTruth) -> Result<()> {
        let expected = self.settings.document_type;
        if truth.document_type != expected {
            anyhow::bail!(
                "Ground truth {:?} is for {} documents, but this run benchmarks {}. \
                 Regenerate it (--regenerate-ground-truth) or point at the matching corpus.",
                ground_truth::sidecar_path(document),
                truth.document_type.name(),
                expected.name()
            );
        }
        Ok(())
    }

    fn load_truths(&self, corpus: &Corpus) -> Result<Vec<GroundTruth>> {
        let paths = corpus.paths();
        let truths = ground_truth::load_all(&paths)?;
        for (path, truth) in paths.iter().zip(&truths) {
            self.check_document_type(path, truth)?;
        }
        let unverified = truths.iter().filter(|t| !t.metadata.verified).count();
        if unverified > 0 {
            tracing::warn!("{} of {} ground truth records are unverified", unverified, truths.len());
        }
        Ok(truths)
    }

    /// Evaluate every candidate in order and rank the results
    pub async fn evaluate(
        &mut self,
        corpus: &Corpus,
        truths: &[GroundTruth],
        candidates: &[CandidateModels],
    ) -> Result<Leaderboard> {
        if truths.len() != corpus.len() {
            anyhow::bail!(
                "Ground truth count ({}) does not match corpus size ({})",
                truths.len(),
                corpus.len()
            );
        }

        let mut results = Vec::with_capacity(candidates.len());
        for (index, candidate) in candidates.iter().enumerate() {
            eprintln!(
                "\n▶ [{}/{}] Testing: {}{}",
                index + 1,
                candidates.len(),
                candidate.label(),
                if candidate.gated { " (gated)" } else { "" }
            );
            let result = self.evaluate_candidate(index, corpus, truths, candidate).await?;
            match &result.disqualification_reason {
                Some(reason) => {
                    eprintln!("  ✗ Disqualified: {}", reason);
                    tracing::info!("{} disqualified: {}", result.label(), reason);
                }
                None => {
                    eprintln!(
                        "  Score: {}/{} ({:.1}%) in {:.1}s",
                        result.total_score,
                        result.max_score,
                        result.ratio() * 100.0,
                        result.elapsed.as_secs_f64()
                    );
                    tracing::info!(
                        "{} scored {}/{}",
                        result.label(),
                        result.total_score,
                        result.max_score
                    );
                }
            }
            results.push(result);
        }

        self.transition(Phase::Aggregating)?;
        let leaderboard = Leaderboard::rank(results);
        self.transition(Phase::Done)?;
        Ok(leaderboard)
    }

    async fn evaluate_candidate(
        &mut self,
        index: usize,
        corpus: &Corpus,
        truths: &[GroundTruth],
        candidate: &CandidateModels,
    ) -> Result<CandidateResult> {
        let max_score = corpus.len() as u32 * self.settings.mode.max_score_per_document();
        let mut result = CandidateResult::new(candidate, max_score);

        self.step(index, CandidateStep::CheckingResources)?;
        let estimate = resources::estimate_memory(&candidate.identifiers());
        if let Some(reason) = Admission::check(estimate, self.available_memory).reason() {
            result.disqualify(reason);
            self.step(index, CandidateStep::Disqualified)?;
            return Ok(result);
        }

        match self.runner.clone() {
            Some(runner) => self.run_isolated(index, &runner, corpus, truths, candidate, result).await,
            None => self.run_in_process(index, corpus, truths, candidate, result).await,
        }
    }

    async fn run_in_process(
        &mut self,
        index: usize,
        corpus: &Corpus,
        truths: &[GroundTruth],
        candidate: &CandidateModels,
        mut result: CandidateResult,
    ) -> Result<CandidateResult> {
        self.step(index, CandidateStep::Loading)?;
        let detector = match self.host.admit(candidate).await {
            Ok(detector) => detector,
            Err(e) => {
                result.disqualify(format!("Load failed: {:#}", e));
                self.step(index, CandidateStep::Disqualified)?;
                return Ok(result);
            }
        };

        self.step(index, CandidateStep::RunningDocuments)?;
        let extract = self.settings.mode == EvaluationMode::Combined;
        let start = Instant::now();
        for (document, truth) in corpus.documents.iter().zip(truths) {
            let outcome = evaluate_document(
                detector.as_ref(),
                &worker_document(document),
                self.settings.document_type,
                extract,
                self.settings.timeout,
            )
            .await;
            let scored = document_result(document, truth, &outcome);
            log_document(&scored);
            result.push(scored);
        }
        result.elapsed = start.elapsed();

        self.step(index, CandidateStep::Releasing)?;
        self.host.release(detector).await;
        Ok(result)
    }

    async fn run_isolated(
        &mut self,
        index: usize,
        runner: &WorkerRunner,
        corpus: &Corpus,
        truths: &[GroundTruth],
        candidate: &CandidateModels,
        mut result: CandidateResult,
    ) -> Result<CandidateResult> {
        let input = WorkerInput {
            candidate: candidate.clone(),
            document_type: self.settings.document_type,
            extract: self.settings.mode == EvaluationMode::Combined,
            timeout_ms: self.settings.timeout.as_millis() as u64,
            documents: corpus.documents.iter().map(worker_document).collect(),
        };

        // The worker loads its own models; the parent stays in Loading until it exits
        self.step(index, CandidateStep::Loading)?;
        let run = match runner.run(&input).await {
            Ok(run) => run,
            Err(e) => {
                result.disqualify(format!("Worker failed to start: {:#}", e));
                self.step(index, CandidateStep::Disqualified)?;
                return Ok(result);
            }
        };
        result.peak_memory_mb = run.peak_memory_mb;
        result.elapsed = run.elapsed;

        let output = match run.outcome {
            WorkerOutcome::LoadFailed(reason) => {
                result.disqualify(format!("Load failed: {}", reason));
                self.step(index, CandidateStep::Disqualified)?;
                return Ok(result);
            }
            WorkerOutcome::Crashed {
                watchdog_fired: true,
                ..
            } => {
                self.step(index, CandidateStep::RunningDocuments)?;
                result.disqualify(format!(
                    "Timed out: worker exceeded its {:.0}s budget",
                    run.budget.as_secs_f64()
                ));
                self.step(index, CandidateStep::Disqualified)?;
                return Ok(result);
            }
            WorkerOutcome::Crashed {
                exit_code, signal, ..
            } => {
                self.step(index, CandidateStep::RunningDocuments)?;
                let cause = match (exit_code, signal) {
                    (_, Some(signal)) => format!("signal {}", signal),
                    (Some(code), None) => format!("exit code {}", code),
                    (None, None) => "unknown status".to_string(),
                };
                result.disqualify(format!("Crashed ({})", cause));
                self.step(index, CandidateStep::Disqualified)?;
                return Ok(result);
            }
            WorkerOutcome::DecodingFailed(reason) => {
                self.step(index, CandidateStep::RunningDocuments)?;
                result.disqualify(format!("Unreadable worker result: {}", reason));
                self.step(index, CandidateStep::Disqualified)?;
                return Ok(result);
            }
            WorkerOutcome::Success(output) => output,
        };

        self.step(index, CandidateStep::RunningDocuments)?;
        result.elapsed = Duration::from_secs_f64(output.inference_secs.max(0.0));

        let outcomes = output.result.into_outcomes();
        let mut timed_out_on = None;
        for ((document, truth), outcome) in corpus.documents.iter().zip(truths).zip(&outcomes) {
            let scored = document_result(document, truth, outcome);
            log_document(&scored);
            let timed_out = scored.timed_out;
            result.push(scored);
            if timed_out {
                timed_out_on = Some(document.filename());
                break;
            }
        }

        // Worker processes are gone once they exit
        self.step(index, CandidateStep::Releasing)?;
        if let Some(filename) = timed_out_on {
            result.disqualify(format!("Timed out on {}", filename));
            self.step(index, CandidateStep::Disqualified)?;
        } else if outcomes.len() < corpus.len() {
            result.disqualify(format!(
                "Worker reported {} of {} documents",
                outcomes.len(),
                corpus.len()
            ));
            self.step(index, CandidateStep::Disqualified)?;
        }
        Ok(result)
    }
}

fn worker_document(document: &CorpusDocument) -> WorkerDocument {
    WorkerDocument {
        path: document.path.clone(),
        is_positive: document.is_positive,
    }
}

/// Score one document outcome; timeouts and detector errors score 0
fn document_result(document: &CorpusDocument, truth: &GroundTruth, outcome: &CombinedOutcome) -> DocumentResult {
    let categorization = &outcome.categorization;
    let extraction = outcome.extraction.as_ref();
    let fields = extraction.and_then(|e| e.fields.as_ref());

    let score = if categorization.timed_out || categorization.error.is_some() {
        DocumentScore::zero()
    } else {
        score_document(truth, categorization.is_match, fields)
    };

    let error = categorization
        .error
        .clone()
        .or_else(|| extraction.and_then(|e| e.error.clone()));

    DocumentResult {
        filename: document.filename(),
        is_positive_sample: document.is_positive,
        predicted_is_match: categorization.is_match,
        categorization_correct: score.categorization_correct,
        extraction_correct: score.extraction_correct,
        score: score.score,
        timed_out: outcome.timed_out(),
        error,
        predicted: fields.cloned(),
    }
}

fn log_document(result: &DocumentResult) {
    let status = if result.timed_out {
        "timeout"
    } else if result.error.is_some() {
        "error"
    } else if result.is_miss() {
        "miss"
    } else {
        "ok"
    };
    tracing::debug!("{} -> score {} ({})", result.filename, result.score, status);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{Categorization, ExtractedFields};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    const GIB: u64 = 1024 * 1024 * 1024;

    /// Answers from the file name: `pos*` matches, fields are fixed
    struct PerfectDetector {
        name: String,
        slow: bool,
    }

    fn expected_fields() -> ExtractedFields {
        ExtractedFields {
            date: Some("2025-06-27".to_string()),
            secondary_field: Some("120.50".to_string()),
            patient_field: Some("Jane Doe".to_string()),
        }
    }

    #[async_trait]
    impl Detector for PerfectDetector {
        fn name(&self) -> &str {
            &self.name
        }

        async fn categorize(&self, document: &Path, _document_type: DocumentType) -> Result<Categorization> {
            if self.slow {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            let name = document.file_name().unwrap().to_string_lossy();
            Ok(Categorization {
                is_match: name.starts_with("pos"),
                confidence: 1.0,
            })
        }

        async fn extract_fields(&self, _document: &Path, _document_type: DocumentType) -> Result<ExtractedFields> {
            Ok(expected_fields())
        }
    }

    /// Records admit/release order
    #[derive(Default)]
    struct RecordingHost {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingHost {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ModelHost for RecordingHost {
        async fn admit(&self, candidate: &CandidateModels) -> Result<Box<dyn Detector>> {
            let label = candidate.label();
            self.events.lock().unwrap().push(format!("admit {}", label));
            if label.contains("broken") {
                anyhow::bail!("weights not found");
            }
            Ok(Box::new(PerfectDetector {
                name: label.clone(),
                slow: label.contains("slow"),
            }))
        }

        async fn release(&self, detector: Box<dyn Detector>) {
            self.events.lock().unwrap().push(format!("release {}", detector.name()));
        }
    }

    fn settings(mode: EvaluationMode) -> RunSettings {
        RunSettings {
            document_type: DocumentType::Invoice,
            mode,
            timeout: Duration::from_secs(10),
        }
    }

    /// Two positives and two negatives with verified ground truth
    fn fixture() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let root = tempfile::tempdir().unwrap();
        let pos = root.path().join("positive");
        let neg = root.path().join("negative");
        std::fs::create_dir_all(&pos).unwrap();
        std::fs::create_dir_all(&neg).unwrap();

        for name in ["pos-a.txt", "pos-b.txt"] {
            let doc = pos.join(name);
            std::fs::write(&doc, "INVOICE").unwrap();
            let fields = expected_fields();
            let mut truth = GroundTruth::negative(DocumentType::Invoice, vec!["org/gen-7b".to_string()]);
            truth.is_match = true;
            truth.date = fields.date;
            truth.secondary_field = Some("120.5".to_string());
            truth.patient_field = Some("jane   doe".to_string());
            truth.metadata.verified = true;
            ground_truth::save(&doc, &truth).unwrap();
        }
        for name in ["neg-a.txt", "neg-b.txt"] {
            let doc = neg.join(name);
            std::fs::write(&doc, "WEATHER").unwrap();
            let mut truth = GroundTruth::negative(DocumentType::Invoice, vec!["org/gen-7b".to_string()]);
            truth.metadata.verified = true;
            ground_truth::save(&doc, &truth).unwrap();
        }
        (root, pos, neg)
    }

    async fn prepared<'a>(
        orchestrator: &mut Orchestrator<'a>,
        pos: &Path,
        neg: &Path,
    ) -> (Corpus, Vec<GroundTruth>) {
        let corpus = orchestrator.enumerate(pos, neg).unwrap();
        let truths = orchestrator
            .ground_truth(&corpus, &CandidateModels::categorizer_only("org/gen-7b"), false, &AutoApprove)
            .await
            .unwrap();
        (corpus, truths)
    }

    #[tokio::test]
    async fn test_end_to_end_combined_scoring() {
        let (_root, pos, neg) = fixture();
        let host = RecordingHost::default();
        let mut orchestrator =
            Orchestrator::new(settings(EvaluationMode::Combined), &host).with_available_memory(64 * GIB);

        let (corpus, truths) = prepared(&mut orchestrator, &pos, &neg).await;
        assert_eq!(orchestrator.phase(), Phase::GroundTruthReady);

        let board = orchestrator
            .evaluate(&corpus, &truths, &[CandidateModels::pair("org/cat-2b", "org/ext-1b")])
            .await
            .unwrap();

        let winner = board.winner().unwrap();
        assert_eq!(winner.total_score, 6);
        assert_eq!(winner.max_score, 8);
        assert_eq!(winner.ratio(), 0.75);
        let scores: Vec<_> = winner.documents.iter().map(|d| d.score).collect();
        assert_eq!(scores, vec![2, 2, 1, 1]);
        assert!(winner.documents[0].extraction_correct);
        assert_eq!(orchestrator.phase(), Phase::Done);
        assert_eq!(
            host.events(),
            vec!["admit org/cat-2b + org/ext-1b", "release org/cat-2b + org/ext-1b"]
        );
    }

    #[tokio::test]
    async fn test_categorizer_mode_caps_at_one() {
        let (_root, pos, neg) = fixture();
        let host = RecordingHost::default();
        let mut orchestrator =
            Orchestrator::new(settings(EvaluationMode::Categorizer), &host).with_available_memory(64 * GIB);
        let (corpus, truths) = prepared(&mut orchestrator, &pos, &neg).await;

        let board = orchestrator
            .evaluate(&corpus, &truths, &[CandidateModels::categorizer_only("org/cat-2b")])
            .await
            .unwrap();
        let winner = board.winner().unwrap();
        assert_eq!((winner.total_score, winner.max_score), (4, 4));
        assert!(winner.documents.iter().all(|d| d.predicted.is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_disqualify_and_release_before_next_admission() {
        let (_root, pos, neg) = fixture();
        let host = RecordingHost::default();
        let mut orchestrator =
            Orchestrator::new(settings(EvaluationMode::Combined), &host).with_available_memory(8 * GIB);
        let (corpus, truths) = prepared(&mut orchestrator, &pos, &neg).await;

        let candidates = vec![
            CandidateModels::categorizer_only("org/huge-72b"),
            CandidateModels::categorizer_only("org/broken-1b"),
            CandidateModels::categorizer_only("org/slow-1b"),
            CandidateModels::categorizer_only("org/good-1b"),
        ];
        let board = orchestrator.evaluate(&corpus, &truths, &candidates).await.unwrap();

        // Memory rejection never reaches the host
        assert_eq!(
            host.events(),
            vec![
                "admit org/broken-1b",
                "admit org/slow-1b",
                "release org/slow-1b",
                "admit org/good-1b",
                "release org/good-1b",
            ]
        );

        let ranked: Vec<_> = board.ranked.iter().map(|r| r.label()).collect();
        assert_eq!(ranked, vec!["org/good-1b", "org/slow-1b"]);

        // In-process timeouts score 0 per document without disqualifying
        let slow = &board.ranked[1];
        assert_eq!(slow.total_score, 0);
        assert!(slow.documents.iter().all(|d| d.timed_out));

        let reasons: Vec<_> = board
            .disqualified
            .iter()
            .map(|r| r.disqualification_reason.clone().unwrap())
            .collect();
        assert!(reasons[0].contains("insufficient memory"), "{}", reasons[0]);
        assert!(reasons[1].contains("Load failed: weights not found"), "{}", reasons[1]);
    }

    #[tokio::test]
    async fn test_unknown_size_is_never_rejected() {
        let (_root, pos, neg) = fixture();
        let host = RecordingHost::default();
        let mut orchestrator =
            Orchestrator::new(settings(EvaluationMode::Categorizer), &host).with_available_memory(1);
        let (corpus, truths) = prepared(&mut orchestrator, &pos, &neg).await;

        let board = orchestrator
            .evaluate(&corpus, &truths, &[CandidateModels::categorizer_only("org/mystery")])
            .await
            .unwrap();
        assert!(board.winner().is_some());
    }

    #[tokio::test]
    async fn test_ground_truth_generation() {
        let root = tempfile::tempdir().unwrap();
        let pos = root.path().join("pos");
        let neg = root.path().join("neg");
        std::fs::create_dir_all(&pos).unwrap();
        std::fs::create_dir_all(&neg).unwrap();
        std::fs::write(pos.join("pos-a.txt"), "INVOICE").unwrap();
        std::fs::write(neg.join("neg-a.txt"), "WEATHER").unwrap();

        let host = RecordingHost::default();
        let mut orchestrator = Orchestrator::new(settings(EvaluationMode::Combined), &host);
        let corpus = orchestrator.enumerate(&pos, &neg).unwrap();
        let generator = CandidateModels::pair("org/gen-7b", "org/ext-7b");
        let truths = orchestrator
            .ground_truth(&corpus, &generator, false, &AutoApprove)
            .await
            .unwrap();

        assert_eq!(orchestrator.phase(), Phase::GroundTruthReady);
        assert!(truths[0].is_match);
        assert_eq!(truths[0].date.as_deref(), Some("2025-06-27"));
        assert!(!truths[0].metadata.verified);
        assert_eq!(truths[0].metadata.generator_model_ids, vec!["org/gen-7b", "org/ext-7b"]);
        assert!(!truths[1].is_match);
        assert!(truths[1].date.is_none());
        assert_eq!(
            host.events(),
            vec!["admit org/gen-7b + org/ext-7b", "release org/gen-7b + org/ext-7b"]
        );
        assert!(ground_truth::sidecar_path(&corpus.documents[1].path).exists());
    }

    #[tokio::test]
    async fn test_ground_truth_for_another_document_type_is_rejected() {
        let (_root, pos, neg) = fixture();
        let host = RecordingHost::default();
        let mut prescriptions = settings(EvaluationMode::Combined);
        prescriptions.document_type = DocumentType::Prescription;
        let generator = CandidateModels::categorizer_only("org/gen-7b");

        let mut orchestrator = Orchestrator::new(prescriptions, &host);
        let corpus = orchestrator.enumerate(&pos, &neg).unwrap();
        let err = orchestrator
            .ground_truth(&corpus, &generator, false, &AutoApprove)
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("pos-a.txt"), "{err}");
        assert!(err.contains("invoice") && err.contains("prescription"), "{err}");
        assert!(host.events().is_empty());

        // Regenerating replaces the mismatched sidecars
        let mut orchestrator = Orchestrator::new(prescriptions, &host);
        let corpus = orchestrator.enumerate(&pos, &neg).unwrap();
        let truths = orchestrator
            .ground_truth(&corpus, &generator, true, &AutoApprove)
            .await
            .unwrap();
        assert_eq!(truths.len(), 4);
        assert!(truths.iter().all(|t| t.document_type == DocumentType::Prescription));
    }

    struct RejectGate;

    impl VerificationGate for RejectGate {
        fn confirm(&self, _written: &[PathBuf]) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_rejected_review_stops_run() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("neg-a.txt"), "x").unwrap();
        let empty = root.path().join("empty");
        std::fs::create_dir_all(&empty).unwrap();

        let host = RecordingHost::default();
        let mut orchestrator = Orchestrator::new(settings(EvaluationMode::Combined), &host);
        let corpus = orchestrator.enumerate(&empty, root.path()).unwrap();
        let err = orchestrator
            .ground_truth(&corpus, &CandidateModels::categorizer_only("org/gen-7b"), false, &RejectGate)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("review aborted"));
        // Negatives only: no model was loaded
        assert!(host.events().is_empty());
    }

    #[test]
    fn test_phase_transitions() {
        use CandidateStep::*;
        let eval = |index, step| Phase::EvaluatingCandidate { index, step };

        assert!(Phase::Idle.can_transition_to(&Phase::EnumeratingCorpus));
        assert!(Phase::GroundTruthReady.can_transition_to(&eval(0, CheckingResources)));
        assert!(eval(0, CheckingResources).can_transition_to(&eval(0, Disqualified)));
        assert!(eval(0, Disqualified).can_transition_to(&eval(1, CheckingResources)));
        assert!(eval(1, Releasing).can_transition_to(&Phase::Aggregating));

        assert!(!Phase::Idle.can_transition_to(&Phase::Done));
        assert!(!eval(0, Loading).can_transition_to(&eval(1, CheckingResources)));
        assert!(!eval(0, Disqualified).can_transition_to(&eval(0, Loading)));
        assert!(!eval(0, Releasing).can_transition_to(&eval(2, CheckingResources)));
        assert!(!Phase::GroundTruthReady.can_transition_to(&eval(1, CheckingResources)));
    }

    #[tokio::test]
    async fn test_illegal_transition_is_rejected() {
        let host = RecordingHost::default();
        let mut orchestrator = Orchestrator::new(settings(EvaluationMode::Combined), &host);
        let err = orchestrator
            .evaluate(&Corpus::default(), &[], &[CandidateModels::categorizer_only("org/a-1b")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Illegal phase transition"), "{err}");
    }

    #[cfg(unix)]
    mod isolated {
        use super::*;

        fn worker(script: &str) -> WorkerRunner {
            WorkerRunner::new("sh", vec!["-c".into(), script.into(), "sh".into()])
                .with_load_allowance(Duration::from_secs(10))
                .with_grace_period(Duration::from_millis(200))
        }

        async fn run_with(script: &str) -> Leaderboard {
            let (_root, pos, neg) = fixture();
            let host = RecordingHost::default();
            let mut orchestrator = Orchestrator::new(settings(EvaluationMode::Combined), &host)
                .with_available_memory(64 * GIB)
                .with_worker(worker(script));
            let (corpus, truths) = prepared(&mut orchestrator, &pos, &neg).await;
            let board = orchestrator
                .evaluate(&corpus, &truths, &[CandidateModels::categorizer_only("org/cat-1b")])
                .await
                .unwrap();
            assert!(host.events().is_empty(), "parent must not load models");
            board
        }

        fn output(documents: &str) -> String {
            format!(
                "printf '%s' '{{\"inference_secs\":1.5,\"result\":{{\"kind\":\"combined\",\"documents\":[{}]}}}}' > \"$2\"",
                documents
            )
        }

        const POS_OK: &str = r#"{"path":"p","is_match":true,"confidence":1.0,"extraction":{"fields":{"date":"2025-06-27","secondary_field":"120.50","patient_field":"Jane Doe"}}}"#;
        const NEG_OK: &str = r#"{"path":"n","is_match":false,"confidence":0.0}"#;
        const POS_TIMEOUT: &str = r#"{"path":"p","is_match":false,"confidence":0.0,"timed_out":true}"#;

        #[tokio::test]
        async fn test_worker_success_scores_all_documents() {
            let docs = [POS_OK, POS_OK, NEG_OK, NEG_OK].join(",");
            let board = run_with(&output(&docs)).await;
            let winner = board.winner().unwrap();
            assert_eq!((winner.total_score, winner.max_score), (6, 8));
            assert_eq!(winner.elapsed, Duration::from_secs_f64(1.5));
        }

        #[tokio::test]
        async fn test_worker_timeout_disqualifies_keeping_prior_scores() {
            let docs = [POS_OK, POS_TIMEOUT].join(",");
            let board = run_with(&output(&docs)).await;
            assert!(board.winner().is_none());
            let result = &board.disqualified[0];
            assert_eq!(result.total_score, 2);
            assert_eq!(result.documents.len(), 2);
            assert_eq!(
                result.disqualification_reason.as_deref(),
                Some("Timed out on pos-b.txt")
            );
        }

        #[tokio::test]
        async fn test_worker_load_failure_and_crash_are_distinct() {
            let board = run_with(r#"printf '%s' '{"reason":"weights not found"}' > "$2"; exit 3"#).await;
            let reason = board.disqualified[0].disqualification_reason.clone().unwrap();
            assert_eq!(reason, "Load failed: weights not found");

            let board = run_with("kill -SEGV $$").await;
            let reason = board.disqualified[0].disqualification_reason.clone().unwrap();
            assert_eq!(reason, format!("Crashed (signal {})", libc::SIGSEGV));
        }
    }
}
