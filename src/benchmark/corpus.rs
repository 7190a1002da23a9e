//! Corpus enumeration
//!
//! A corpus is two flat directories: documents that should match the target
//! type (positives) and documents that should not (negatives). Placement,
//! not ground truth, decides which is which.
//!
//! Order is deterministic: positives before negatives, alphabetical by file
//! name within each. Hidden files and ground truth sidecars are skipped.

use anyhow::{Context, Result};
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};

use crate::ground_truth::is_sidecar;

/// One document of the corpus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusDocument {
    pub path: PathBuf,
    pub is_positive: bool,
}

impl CorpusDocument {
    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Documents in evaluation order
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    pub documents: Vec<CorpusDocument>,
}

impl Corpus {
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn positive_count(&self) -> usize {
        self.documents.iter().filter(|d| d.is_positive).count()
    }

    pub fn negative_count(&self) -> usize {
        self.len() - self.positive_count()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.documents.iter().map(|d| d.path.clone()).collect()
    }
}

/// Enumerate both sample directories
pub fn load_corpus(positive_dir: &Path, negative_dir: &Path) -> Result<Corpus> {
    let mut documents = Vec::new();
    for (dir, is_positive) in [(positive_dir, true), (negative_dir, false)] {
        documents.extend(
            list_documents(dir)?
                .into_iter()
                .map(|path| CorpusDocument { path, is_positive }),
        );
    }

    if documents.is_empty() {
        anyhow::bail!(
            "No documents found in {:?} or {:?}",
            positive_dir,
            negative_dir
        );
    }

    Ok(Corpus { documents })
}

fn list_documents(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        anyhow::bail!("Corpus directory not found: {:?}", dir);
    }

    let walker = WalkBuilder::new(dir)
        .hidden(true)
        .git_ignore(false)
        .max_depth(Some(1))
        .build();

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to read corpus directory {:?}", dir))?;
        let path = entry.path();
        if !path.is_file() || is_sidecar(path) {
            continue;
        }
        files.push(path.to_path_buf());
    }

    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"content").unwrap();
    }

    #[test]
    fn test_positives_first_then_alphabetical() {
        let root = tempfile::tempdir().unwrap();
        let pos = root.path().join("pos");
        let neg = root.path().join("neg");
        std::fs::create_dir_all(pos.join("nested")).unwrap();
        std::fs::create_dir_all(&neg).unwrap();

        touch(&pos, "b.pdf");
        touch(&pos, "a.pdf");
        touch(&pos, "a.pdf.groundtruth.json");
        touch(&pos, ".DS_Store");
        touch(&pos.join("nested"), "deep.pdf");
        touch(&neg, "z.png");
        touch(&neg, "c.png");

        let corpus = load_corpus(&pos, &neg).unwrap();
        let names: Vec<_> = corpus.documents.iter().map(|d| d.filename()).collect();
        assert_eq!(names, vec!["a.pdf", "b.pdf", "c.png", "z.png"]);
        assert_eq!(corpus.positive_count(), 2);
        assert_eq!(corpus.negative_count(), 2);
        assert!(corpus.documents[1].is_positive);
        assert!(!corpus.documents[2].is_positive);
    }

    #[test]
    fn test_missing_directory_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let err = load_corpus(&root.path().join("nope"), root.path()).unwrap_err();
        assert!(err.to_string().contains("Corpus directory not found"));
    }

    #[test]
    fn test_empty_corpus_is_fatal() {
        let root = tempfile::tempdir().unwrap();
        let err = load_corpus(root.path(), root.path()).unwrap_err();
        assert!(err.to_string().contains("No documents found"));
    }
}
