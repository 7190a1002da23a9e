//! Model cache cleanup
//!
//! Benchmarks download every candidate into the Hugging Face hub cache
//! (`<cache>/models--<org>--<name>`). After a run, everything that was used
//! but not kept can be removed. Malformed identifiers are skipped and a
//! directory that cannot be deleted does not stop the others.

use ignore::WalkBuilder;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::discovery::is_concrete;
use crate::resources::format_bytes;

/// Outcome of a cleanup pass
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// Removed model ids with the bytes reclaimed
    pub removed: Vec<(String, u64)>,
    /// Ids ignored because they are malformed or not cached
    pub skipped: Vec<String>,
    /// Ids whose directory could not be removed, with the error
    pub failed: Vec<(String, String)>,
}

impl CleanupReport {
    pub fn reclaimed_bytes(&self) -> u64 {
        self.removed.iter().map(|(_, bytes)| bytes).sum()
    }

    pub fn format_summary(&self) -> String {
        format!(
            "Removed {} models ({}) | skipped {} | failed {}",
            self.removed.len(),
            format_bytes(self.reclaimed_bytes()),
            self.skipped.len(),
            self.failed.len()
        )
    }
}

/// Cache directory for a model id, `None` for ids that cannot name one safely
pub fn cache_dir_for(cache_root: &Path, model_id: &str) -> Option<PathBuf> {
    if !is_concrete(model_id) {
        return None;
    }
    let (org, name) = model_id.split_once('/')?;
    let safe = |part: &str| {
        !part.starts_with('.')
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    if !safe(org) || !safe(name) {
        return None;
    }
    Some(cache_root.join(format!("models--{}--{}", org, name)))
}

/// Delete cached artifacts for every used model not in `keep`
pub fn cleanup(cache_root: &Path, used: &[String], keep: &HashSet<String>) -> CleanupReport {
    let mut report = CleanupReport::default();
    let mut seen = HashSet::new();

    for model_id in used {
        if keep.contains(model_id) || !seen.insert(model_id.as_str()) {
            continue;
        }

        let Some(dir) = cache_dir_for(cache_root, model_id) else {
            tracing::warn!("Skipping malformed model id {:?}", model_id);
            report.skipped.push(model_id.clone());
            continue;
        };

        if !dir.is_dir() {
            tracing::debug!("{} is not cached at {:?}", model_id, dir);
            report.skipped.push(model_id.clone());
            continue;
        }

        let size = dir_size(&dir);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::info!("Removed {} ({})", model_id, format_bytes(size));
                report.removed.push((model_id.clone(), size));
            }
            Err(e) => {
                tracing::warn!("Failed to remove {:?}: {}", dir, e);
                report.failed.push((model_id.clone(), e.to_string()));
            }
        }
    }

    report
}

/// Total size of regular files below a directory, symlinks not followed
fn dir_size(dir: &Path) -> u64 {
    WalkBuilder::new(dir)
        .standard_filters(false)
        .follow_links(false)
        .build()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_some_and(|t| t.is_file()))
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_model(root: &Path, org: &str, name: &str, bytes: usize) -> PathBuf {
        let dir = root.join(format!("models--{}--{}", org, name));
        std::fs::create_dir_all(dir.join("blobs")).unwrap();
        std::fs::write(dir.join("blobs").join("weights"), vec![0u8; bytes]).unwrap();
        dir
    }

    #[test]
    fn test_cache_dir_for() {
        let root = Path::new("/cache");
        assert_eq!(
            cache_dir_for(root, "mlx-community/Qwen2.5-VL-7B-Instruct-4bit"),
            Some(PathBuf::from("/cache/models--mlx-community--Qwen2.5-VL-7B-Instruct-4bit"))
        );
        assert_eq!(cache_dir_for(root, "qwen2.5-vl"), None);
        assert_eq!(cache_dir_for(root, "../etc"), None);
        assert_eq!(cache_dir_for(root, "org/.."), None);
        assert_eq!(cache_dir_for(root, "org/na me"), None);
    }

    #[test]
    fn test_cleanup_removes_unkept_models() {
        let root = tempfile::tempdir().unwrap();
        let loser = cache_model(root.path(), "org", "loser-3b", 1024);
        let winner = cache_model(root.path(), "org", "winner-7b", 2048);

        let used = vec![
            "org/loser-3b".to_string(),
            "org/winner-7b".to_string(),
            "org/loser-3b".to_string(),
            "org/never-downloaded".to_string(),
            "family-name".to_string(),
        ];
        let keep: HashSet<String> = ["org/winner-7b".to_string()].into_iter().collect();

        let report = cleanup(root.path(), &used, &keep);

        assert!(!loser.exists());
        assert!(winner.exists());
        assert_eq!(report.removed, vec![("org/loser-3b".to_string(), 1024)]);
        assert_eq!(report.reclaimed_bytes(), 1024);
        assert_eq!(report.skipped, vec!["org/never-downloaded".to_string(), "family-name".to_string()]);
        assert!(report.failed.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_cleanup_continues_after_failure() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempfile::tempdir().unwrap();
        let locked = cache_model(root.path(), "org", "locked-1b", 16);
        let free = cache_model(root.path(), "org", "free-1b", 16);
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();

        let used = vec!["org/locked-1b".to_string(), "org/free-1b".to_string()];
        let report = cleanup(root.path(), &used, &HashSet::new());
        let _ = std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755));

        assert!(!free.exists());
        assert!(report.removed.iter().any(|(id, _)| id == "org/free-1b"));
        // root ignores permission bits, so the locked one may go either way
        assert_eq!(report.removed.len() + report.failed.len(), 2);
    }
}
