//! Verifier & Anomaly Detector (§4.11): the gate between "return" and
//! "fall back" in the Tiered Fetcher.
//!
//! Grounded on `packages/intelligent-crawler/src/effects/flagging.rs`'s
//! `FlaggingEffect::flag_page` shape — a cheap pre-filter first, then a
//! confidence-thresholded decision, each branch producing a result
//! record rather than bailing out early. Here the "AI evaluation" step
//! is replaced by the purely heuristic checks §4.11 enumerates, since
//! this crate carries no LLM dependency (§1 Non-goals).

use std::collections::HashMap;

use crate::extractor::ExtractedContent;
use crate::learning::{AnomalyType, DetectedAnomaly};
use crate::types::api_pattern::ApiPattern;
use crate::types::decision_trace::Validation;
use crate::types::domain_entry::ValidatorRule;
use crate::types::request::VerifyMode;

const STRUCTURAL_MARKERS: &[&str] = &["<article", "<main", "<table", "<h1", "<h2"];

/// Runs the verification pass appropriate to `mode` and produces the
/// `Validation` record the Tiered Fetcher gates on (§4.11).
pub fn verify(
    mode: VerifyMode,
    html: &str,
    extracted: &ExtractedContent,
    min_content_length: usize,
    anomaly: &DetectedAnomaly,
    validators: &[ValidatorRule],
    matched_pattern: Option<&ApiPattern>,
    expected_language: Option<&str>,
) -> Validation {
    let mut checks = Vec::new();
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if mode == VerifyMode::Off {
        return Validation {
            passed: true,
            confidence: 1.0,
            checks: vec!["verification disabled".to_string()],
            errors,
            warnings,
        };
    }

    let content_len = extracted.content.text.trim().len();
    basic_checks(extracted, content_len, min_content_length, anomaly, &mut checks, &mut errors);

    if mode == VerifyMode::Basic {
        return finish(checks, errors, warnings, 0.6, 1.0);
    }

    standard_checks(html, extracted, validators, &mut checks, &mut errors, &mut warnings);

    if mode == VerifyMode::Standard {
        return finish(checks, errors, warnings, 0.75, 0.9);
    }

    thorough_checks(extracted, matched_pattern, expected_language, &mut checks, &mut errors, &mut warnings);
    finish(checks, errors, warnings, 0.9, 0.8)
}

fn basic_checks(
    extracted: &ExtractedContent,
    content_len: usize,
    min_content_length: usize,
    anomaly: &DetectedAnomaly,
    checks: &mut Vec<String>,
    errors: &mut Vec<String>,
) {
    let has_title = extracted.title.as_ref().map(|t| !t.trim().is_empty()).unwrap_or(false);
    checks.push("non-empty title".to_string());
    if !has_title {
        errors.push("title is empty".to_string());
    }

    checks.push(format!("content length >= {min_content_length}"));
    if content_len < min_content_length {
        errors.push(format!("content length {content_len} below minimum {min_content_length}"));
    }

    checks.push("not a known anomaly type".to_string());
    if anomaly.is_anomaly {
        errors.push(format!(
            "anomaly detected: {}",
            anomaly.anomaly_type.map(AnomalyType::as_str).unwrap_or("unknown")
        ));
    }
}

fn standard_checks(
    html: &str,
    extracted: &ExtractedContent,
    validators: &[ValidatorRule],
    checks: &mut Vec<String>,
    errors: &mut Vec<String>,
    warnings: &mut Vec<String>,
) {
    for validator in validators {
        let reasons = validator.validate(&extracted.content.text, None, 0);
        checks.push("learning engine validator".to_string());
        errors.extend(reasons);
    }

    let has_structural_marker = STRUCTURAL_MARKERS.iter().any(|m| html.to_ascii_lowercase().contains(m));
    checks.push("at least one structural marker present".to_string());
    if !has_structural_marker {
        warnings.push("no article/main/heading/table marker found".to_string());
    }
}

fn thorough_checks(
    extracted: &ExtractedContent,
    matched_pattern: Option<&ApiPattern>,
    expected_language: Option<&str>,
    checks: &mut Vec<String>,
    errors: &mut Vec<String>,
    warnings: &mut Vec<String>,
) {
    if let Some(pattern) = matched_pattern {
        checks.push("API pattern field cross-check".to_string());
        let present = cross_check_fields(extracted, &pattern.content_mapping);
        if present < 0.5 {
            errors.push(format!(
                "only {:.0}% of API-pattern-mapped fields present, need >= 50%",
                present * 100.0
            ));
        }
    } else {
        warnings.push("no matching API pattern to cross-check against".to_string());
    }

    if let Some(expected) = expected_language {
        checks.push("language consistency".to_string());
        // Heuristic detector here is intentionally shallow: non-ASCII
        // ratio stands in for a real language model (no NLP dependency
        // carried, matching the extractor's no-new-dependency stance).
        let non_ascii = extracted.content.text.chars().filter(|c| !c.is_ascii()).count();
        let ratio = non_ascii as f64 / extracted.content.text.len().max(1) as f64;
        let looks_non_english = ratio > 0.1;
        if expected == "en" && looks_non_english {
            warnings.push("content appears non-English but language=en was expected".to_string());
        }
    }
}

fn cross_check_fields(extracted: &ExtractedContent, content_mapping: &HashMap<String, String>) -> f64 {
    if content_mapping.is_empty() {
        return 1.0;
    }
    let present = content_mapping
        .keys()
        .filter(|field| match field.as_str() {
            "title" => extracted.title.is_some(),
            "text" | "content" => !extracted.content.text.trim().is_empty(),
            other => extracted.field_confidence.contains_key(other),
        })
        .count();
    present as f64 / content_mapping.len() as f64
}

fn finish(checks: Vec<String>, errors: Vec<String>, warnings: Vec<String>, base_confidence: f32, penalty_scale: f32) -> Validation {
    let passed = errors.is_empty();
    let confidence = if passed {
        base_confidence + (1.0 - base_confidence) * (1.0 - warnings.len() as f32 * 0.1).max(0.0)
    } else {
        (base_confidence * penalty_scale - errors.len() as f32 * 0.15).max(0.0)
    };
    Validation {
        passed,
        confidence: confidence.clamp(0.0, 1.0),
        checks,
        errors,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::browse_result::ContentBlock;

    fn content(title: Option<&str>, text: &str) -> ExtractedContent {
        ExtractedContent {
            title: title.map(|s| s.to_string()),
            content: ContentBlock {
                html: String::new(),
                text: text.to_string(),
                markdown: String::new(),
            },
            tables: Vec::new(),
            field_confidence: HashMap::new(),
        }
    }

    fn no_anomaly() -> DetectedAnomaly {
        DetectedAnomaly {
            is_anomaly: false,
            anomaly_type: None,
            confidence: 0.0,
            reasons: Vec::new(),
            suggested_action: None,
            wait_time_ms: None,
        }
    }

    #[test]
    fn basic_mode_fails_on_short_content() {
        let extracted = content(Some("Title"), "too short");
        let result = verify(VerifyMode::Basic, "<html></html>", &extracted, 500, &no_anomaly(), &[], None, None);
        assert!(!result.passed);
        assert!(!result.errors.is_empty());
    }

    #[test]
    fn basic_mode_passes_sufficient_content() {
        let text = "a".repeat(600);
        let extracted = content(Some("Title"), &text);
        let result = verify(VerifyMode::Basic, "<html></html>", &extracted, 500, &no_anomaly(), &[], None, None);
        assert!(result.passed);
    }

    #[test]
    fn standard_mode_warns_without_structural_marker() {
        let text = "a".repeat(600);
        let extracted = content(Some("Title"), &text);
        let result = verify(
            VerifyMode::Standard,
            "<html><body><div>no markers</div></body></html>",
            &extracted,
            500,
            &no_anomaly(),
            &[],
            None,
            None,
        );
        assert!(result.passed);
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn off_mode_always_passes() {
        let extracted = content(None, "");
        let result = verify(VerifyMode::Off, "", &extracted, 500, &no_anomaly(), &[], None, None);
        assert!(result.passed);
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn thorough_mode_fails_when_mapped_fields_mostly_absent() {
        let extracted = content(None, "a".repeat(600).as_str());
        let mut pattern = ApiPattern::new("/posts/{id}", "GET");
        pattern.content_mapping.insert("title".to_string(), "$.title".to_string());
        pattern.content_mapping.insert("author".to_string(), "$.author".to_string());
        pattern.content_mapping.insert("published_at".to_string(), "$.published_at".to_string());
        let result = verify(
            VerifyMode::Thorough,
            "<article>body</article>",
            &extracted,
            500,
            &no_anomaly(),
            &[],
            Some(&pattern),
            None,
        );
        assert!(!result.passed);
    }
}
