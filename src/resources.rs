//! Memory estimation and monitoring for benchmark candidates
//!
//! Candidates are admitted only when their estimated footprint fits in the
//! memory the machine can spare. The estimate is derived from the parameter
//! count embedded in model identifiers (`Qwen2.5-VL-7B-Instruct` -> 7B).
//! While an isolated worker runs, its resident memory is sampled to report
//! the peak.

use regex::Regex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Bytes per parameter at the expected 4-bit quantization
pub const BYTES_PER_PARAMETER: f64 = 0.5;

/// Multiplier covering KV cache, activations and runtime buffers
pub const RUNTIME_OVERHEAD: f64 = 1.2;

/// Share of physical memory a candidate may use, the rest is headroom
pub const AVAILABLE_FRACTION: f64 = 0.8;

/// Sampling interval for peak memory tracking
const SAMPLE_INTERVAL_MS: u64 = 50;

const BILLION: f64 = 1_000_000_000.0;

static PARAMETER_COUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+(?:\.\d+)?)b(?:[^a-z]|$)").expect("parameter count pattern is valid")
});

/// Parameter count in billions, from the first `<number>B` token in an identifier
pub fn parameter_count_billions(model_id: &str) -> Option<f64> {
    PARAMETER_COUNT
        .captures(model_id)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|count| *count > 0.0)
}

/// Estimated bytes needed to hold all models of a candidate
///
/// Zero means unknown: no identifier carried a parameter count.
pub fn estimate_memory<S: AsRef<str>>(model_ids: &[S]) -> u64 {
    let billions: f64 = model_ids
        .iter()
        .filter_map(|id| parameter_count_billions(id.as_ref()))
        .sum();
    (billions * BILLION * BYTES_PER_PARAMETER * RUNTIME_OVERHEAD) as u64
}

/// Total physical memory in bytes
pub fn total_memory() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    system.total_memory()
}

/// Memory a candidate may use, in bytes
pub fn available_memory() -> u64 {
    (total_memory() as f64 * AVAILABLE_FRACTION) as u64
}

/// Pre-flight admission decision for a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected { estimate: u64, available: u64 },
}

impl Admission {
    /// Reject only when both values are known and the estimate does not fit
    pub fn check(estimate: u64, available: u64) -> Self {
        if estimate > 0 && available > 0 && estimate > available {
            Self::Rejected { estimate, available }
        } else {
            Self::Admitted
        }
    }

    pub fn reason(&self) -> Option<String> {
        match self {
            Self::Admitted => None,
            Self::Rejected { estimate, available } => Some(format!(
                "insufficient memory: needs ~{}, {} available",
                format_bytes(*estimate),
                format_bytes(*available)
            )),
        }
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.1} GB", b / GB)
    } else if b >= MB {
        format!("{:.1} MB", b / MB)
    } else {
        format!("{} B", bytes)
    }
}

/// Tracks the peak resident memory of a process
pub struct ResourceMonitor {
    pid: Pid,
    peak_memory_mb: Arc<AtomicU64>,
    sampling_active: Arc<AtomicBool>,
}

impl ResourceMonitor {
    /// Monitor an arbitrary process, e.g. a worker child
    pub fn for_pid(pid: u32) -> Self {
        Self {
            pid: Pid::from_u32(pid),
            peak_memory_mb: Arc::new(AtomicU64::new(0f64.to_bits())),
            sampling_active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Monitor the current process
    pub fn current() -> Self {
        Self::for_pid(std::process::id())
    }

    /// Start background memory sampling
    ///
    /// Sampling runs until the returned handle is dropped.
    pub fn start_sampling(&self) -> SamplingHandle {
        self.sampling_active.store(true, Ordering::SeqCst);

        let peak_memory = Arc::clone(&self.peak_memory_mb);
        let sampling_active = Arc::clone(&self.sampling_active);
        let pid = self.pid;

        // Plain thread: sysinfo refreshes block
        let handle = std::thread::spawn(move || {
            let mut system = System::new();

            while sampling_active.load(Ordering::SeqCst) {
                system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                match system.process(pid) {
                    Some(process) => {
                        let current_mb = process.memory() as f64 / (1024.0 * 1024.0);
                        update_peak(&peak_memory, current_mb);
                    }
                    None => break,
                }
                std::thread::sleep(Duration::from_millis(SAMPLE_INTERVAL_MS));
            }
        });

        SamplingHandle {
            sampling_active: Arc::clone(&self.sampling_active),
            _thread: Some(handle),
        }
    }

    /// Highest resident memory seen so far, `None` if nothing was sampled
    pub fn peak_memory_mb(&self) -> Option<f64> {
        let peak = f64::from_bits(self.peak_memory_mb.load(Ordering::SeqCst));
        (peak > 0.0).then_some(peak)
    }
}

fn update_peak(peak: &AtomicU64, current_mb: f64) {
    let current_bits = current_mb.to_bits();
    loop {
        let peak_bits = peak.load(Ordering::SeqCst);
        if current_mb <= f64::from_bits(peak_bits) {
            break;
        }
        if peak
            .compare_exchange(peak_bits, current_bits, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            break;
        }
    }
}

/// Handle for background memory sampling
///
/// Sampling continues while this handle is held. Drop to stop sampling.
pub struct SamplingHandle {
    sampling_active: Arc<AtomicBool>,
    _thread: Option<std::thread::JoinHandle<()>>,
}

impl Drop for SamplingHandle {
    fn drop(&mut self) {
        // The thread exits on its next iteration; not joined to avoid blocking
        self.sampling_active.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_count_extraction() {
        assert_eq!(parameter_count_billions("mlx-community/Qwen2.5-VL-7B-Instruct-4bit"), Some(7.0));
        assert_eq!(parameter_count_billions("llava-hf/llava-1.5-13b-hf"), Some(13.0));
        assert_eq!(parameter_count_billions("google/gemma-3-4b-it"), Some(4.0));
        assert_eq!(parameter_count_billions("org/model-1.5B"), Some(1.5));
        assert_eq!(parameter_count_billions("HuggingFaceTB/SmolVLM-256M-Instruct"), None);
        assert_eq!(parameter_count_billions("microsoft/Phi-3.5-vision-instruct"), None);
    }

    #[test]
    fn test_first_match_wins() {
        assert_eq!(parameter_count_billions("org/mix-3b-then-70b"), Some(3.0));
    }

    #[test]
    fn test_estimate_memory() {
        let near = |bytes: u64, expected: u64| bytes.abs_diff(expected) < 1_000;
        // 7B * 0.5 bytes * 1.2
        assert!(near(estimate_memory(&["org/model-7B"]), 4_200_000_000));
        // pair sums both models, unknown ones contribute nothing
        assert!(near(
            estimate_memory(&["org/vision-3B", "org/text-4B", "org/mystery"]),
            4_200_000_000
        ));
        assert_eq!(estimate_memory(&["org/mystery", "org/other"]), 0);
        assert_eq!(estimate_memory::<&str>(&[]), 0);
    }

    #[test]
    fn test_admission_check() {
        assert_eq!(Admission::check(10, 5), Admission::Rejected { estimate: 10, available: 5 });
        assert_eq!(Admission::check(5, 10), Admission::Admitted);
        // unknown estimate never gates
        assert_eq!(Admission::check(0, 1), Admission::Admitted);
        assert_eq!(Admission::check(0, 0), Admission::Admitted);
        // unknown availability never gates
        assert_eq!(Admission::check(u64::MAX, 0), Admission::Admitted);
    }

    #[test]
    fn test_rejection_reason_cites_both_values() {
        let reason = Admission::check(8 * 1024 * 1024 * 1024, 4 * 1024 * 1024 * 1024)
            .reason()
            .unwrap();
        assert!(reason.contains("8.0 GB"), "{reason}");
        assert!(reason.contains("4.0 GB"), "{reason}");
    }

    #[test]
    fn test_available_memory_is_fraction_of_total() {
        let total = total_memory();
        assert!(total > 0);
        assert!(available_memory() < total);
    }

    #[test]
    fn test_monitor_samples_current_process() {
        let monitor = ResourceMonitor::current();
        let handle = monitor.start_sampling();
        std::thread::sleep(Duration::from_millis(200));
        drop(handle);

        assert!(monitor.peak_memory_mb().unwrap() > 0.0);
    }
}
