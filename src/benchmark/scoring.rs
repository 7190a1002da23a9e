//! Fuzzy scoring of predictions against ground truth
//!
//! One point for a correct categorization, one more for a fully correct
//! extraction when extraction was evaluated. Field comparison is tolerant:
//!
//! - Dates compare as calendar days (`2025-06-27` == `2025-06-27T00:00:00Z`)
//! - Numbers compare within [`NUMERIC_TOLERANCE`] (`1` == `1.00`)
//! - Text compares case-insensitively with `_` and whitespace runs collapsed
//!
//! Everything here is pure and order independent.

use chrono::{DateTime, NaiveDate, NaiveDateTime};

use crate::detector::ExtractedFields;
use crate::ground_truth::GroundTruth;

/// Absolute tolerance for numeric field equality
pub const NUMERIC_TOLERANCE: f64 = 0.001;

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%d.%m.%Y", "%d/%m/%Y", "%Y%m%d"];
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"];

/// Score of a single document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentScore {
    pub categorization_correct: bool,
    /// Only true when categorization is also correct and extraction ran
    pub extraction_correct: bool,
    pub score: u32,
}

impl DocumentScore {
    pub fn zero() -> Self {
        Self {
            categorization_correct: false,
            extraction_correct: false,
            score: 0,
        }
    }
}

/// Score a prediction against its ground truth
///
/// `extracted` is `None` when extraction was not run for this document, which
/// caps the score at 1. With extracted fields the cap is 2.
pub fn score_document(
    expected: &GroundTruth,
    actual_is_match: bool,
    extracted: Option<&ExtractedFields>,
) -> DocumentScore {
    if expected.is_match != actual_is_match {
        return DocumentScore::zero();
    }

    let cap = if extracted.is_some() { 2 } else { 1 };

    // True negative: nothing to extract, assessed only when extraction ran
    if !expected.is_match {
        return DocumentScore {
            categorization_correct: true,
            extraction_correct: extracted.is_some(),
            score: cap,
        };
    }

    let Some(fields) = extracted else {
        return DocumentScore {
            categorization_correct: true,
            extraction_correct: false,
            score: 1,
        };
    };

    let extraction_correct = dates_match(expected.date.as_deref(), fields.date.as_deref())
        && values_match(expected.secondary_field.as_deref(), fields.secondary_field.as_deref())
        && values_match(expected.patient_field.as_deref(), fields.patient_field.as_deref());

    DocumentScore {
        categorization_correct: true,
        extraction_correct,
        score: 1 + u32::from(extraction_correct),
    }
}

/// Calendar-day equality; two missing dates are equal, one missing is not
pub fn dates_match(expected: Option<&str>, actual: Option<&str>) -> bool {
    match (expected, actual) {
        (None, None) => true,
        (Some(e), Some(a)) => match (parse_date(e), parse_date(a)) {
            (Some(e), Some(a)) => e == a,
            _ => texts_match(e, a),
        },
        _ => false,
    }
}

/// Numeric equality when both sides parse as numbers, text equality otherwise
pub fn values_match(expected: Option<&str>, actual: Option<&str>) -> bool {
    match (expected, actual) {
        (None, None) => true,
        (Some(e), Some(a)) => match (parse_number(e), parse_number(a)) {
            (Some(e), Some(a)) => numbers_match(e, a),
            _ => texts_match(e, a),
        },
        _ => false,
    }
}

pub fn numbers_match(expected: f64, actual: f64) -> bool {
    (expected - actual).abs() <= NUMERIC_TOLERANCE + f64::EPSILON
}

pub fn texts_match(expected: &str, actual: &str) -> bool {
    normalize_text(expected) == normalize_text(actual)
}

/// Lowercase, `_` as space, whitespace runs collapsed, trimmed
pub fn normalize_text(text: &str) -> String {
    text.replace('_', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|dt| dt.date())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        })
}

/// Parse a number, ignoring surrounding whitespace and a leading currency sign
pub fn parse_number(raw: &str) -> Option<f64> {
    let trimmed = raw
        .trim()
        .trim_start_matches(['$', '€', '£'])
        .trim();
    trimmed.parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DocumentType;
    use crate::ground_truth::GroundTruthMetadata;

    fn truth(is_match: bool) -> GroundTruth {
        GroundTruth {
            is_match,
            document_type: DocumentType::Invoice,
            date: is_match.then(|| "2025-06-27".to_string()),
            secondary_field: is_match.then(|| "120.5".to_string()),
            patient_field: is_match.then(|| "Acme_Corp".to_string()),
            metadata: GroundTruthMetadata::unverified(vec![]),
        }
    }

    fn fields(date: Option<&str>, secondary: Option<&str>, patient: Option<&str>) -> ExtractedFields {
        ExtractedFields {
            date: date.map(String::from),
            secondary_field: secondary.map(String::from),
            patient_field: patient.map(String::from),
        }
    }

    #[test]
    fn test_true_negative_is_max_score_regardless_of_fields() {
        let expected = truth(false);
        let noisy = fields(Some("1999-01-01"), Some("42"), Some("someone"));

        let only = score_document(&expected, false, None);
        assert!(only.categorization_correct);
        assert!(!only.extraction_correct);
        assert_eq!(only.score, 1);

        let combined = score_document(&expected, false, Some(&noisy));
        assert!(combined.categorization_correct);
        assert!(combined.extraction_correct);
        assert_eq!(combined.score, 2);
    }

    #[test]
    fn test_false_negative_scores_zero() {
        let expected = truth(true);
        let perfect = fields(Some("2025-06-27"), Some("120.5"), Some("acme corp"));
        assert_eq!(score_document(&expected, false, Some(&perfect)), DocumentScore::zero());
        assert_eq!(score_document(&expected, false, None), DocumentScore::zero());
    }

    #[test]
    fn test_false_positive_scores_zero() {
        assert_eq!(score_document(&truth(false), true, None).score, 0);
    }

    #[test]
    fn test_true_positive_with_perfect_extraction() {
        let expected = truth(true);
        let perfect = fields(Some("2025-06-27T00:00:00Z"), Some("120.50"), Some("ACME   corp"));
        let score = score_document(&expected, true, Some(&perfect));
        assert!(score.categorization_correct);
        assert!(score.extraction_correct);
        assert_eq!(score.score, 2);
    }

    #[test]
    fn test_true_positive_with_one_wrong_field() {
        let expected = truth(true);
        let wrong_amount = fields(Some("2025-06-27"), Some("121"), Some("acme corp"));
        let score = score_document(&expected, true, Some(&wrong_amount));
        assert!(score.categorization_correct);
        assert!(!score.extraction_correct);
        assert_eq!(score.score, 1);
    }

    #[test]
    fn test_true_positive_without_extraction_caps_at_one() {
        let score = score_document(&truth(true), true, None);
        assert!(score.categorization_correct);
        assert!(!score.extraction_correct);
        assert_eq!(score.score, 1);
    }

    #[test]
    fn test_dates_match() {
        assert!(dates_match(Some("2025-06-27"), Some("2025-06-27T00:00:00Z")));
        assert!(dates_match(Some("2025-06-27"), Some("2025-06-27T23:59:59")));
        assert!(dates_match(Some("27.06.2025"), Some("2025-06-27")));
        assert!(dates_match(None, None));
        assert!(!dates_match(None, Some("2025-06-27")));
        assert!(!dates_match(Some("2025-06-27"), None));
        assert!(!dates_match(Some("2025-06-27"), Some("2025-06-28")));
    }

    #[test]
    fn test_numbers_match() {
        assert!(values_match(Some("1"), Some("1.0")));
        assert!(values_match(Some("1.0"), Some("1.00")));
        assert!(values_match(Some("1"), Some("1.00")));
        assert!(values_match(Some("$120.5"), Some("120.50")));
        assert!(!values_match(Some("1"), Some("1.01")));
        assert!(values_match(None, None));
        assert!(!values_match(Some("1"), None));
    }

    #[test]
    fn test_texts_match() {
        assert!(values_match(Some("Acme_Corp"), Some("acme corp")));
        assert!(texts_match("  Dr.  John\tSmith ", "dr. john smith"));
        assert!(!texts_match("John Smith", "Jon Smith"));
        assert_eq!(normalize_text("A__B  c"), "a b c");
    }

    #[test]
    fn test_score_is_order_independent() {
        let expected = truth(true);
        let a = fields(Some("2025-06-27"), Some("120.5"), Some("acme corp"));
        let b = fields(Some("2025-06-28"), Some("120.5"), Some("acme corp"));
        let first = (score_document(&expected, true, Some(&a)), score_document(&expected, true, Some(&b)));
        let second = (score_document(&expected, true, Some(&b)), score_document(&expected, true, Some(&a)));
        assert_eq!(first.0, second.1);
        assert_eq!(first.1, second.0);
    }
}
