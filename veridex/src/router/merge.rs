//! Hybrid-mode result merging and comparison analysis.

use std::collections::{BTreeSet, HashMap};

use chrono::Utc;

use crate::rulepack::{ComparisonDelta, RagValidationData, ValidationFailure, ValidationResponse};

/// Default confidence substituted for a failure missing `ai_confidence`.
pub const DEFAULT_FAILURE_CONFIDENCE: f64 = 0.8;

/// Mean per-failure confidence: 1.0 for an empty set (nothing contested),
/// 0.8 substituted for failures missing a confidence.
pub fn average_confidence(failures: &[ValidationFailure]) -> f64 {
    if failures.is_empty() {
        return 1.0;
    }
    let sum: f64 = failures
        .iter()
        .map(|f| f.ai_confidence.unwrap_or(DEFAULT_FAILURE_CONFIDENCE))
        .sum();
    sum / failures.len() as f64
}

/// Merge the RAG leg into the authoritative JSON response.
///
/// JSON failures stay authoritative; matching RAG failures (joined on
/// `rule_id`, no ordering requirement between legs) contribute AI fields
/// where the JSON side has none, and their policy references and suggested
/// actions are appended. The comparison delta feeds the training dashboard.
pub fn merge_hybrid_results(
    mut json_response: ValidationResponse,
    rag: &RagValidationData,
) -> ValidationResponse {
    let json_ids: BTreeSet<String> = json_response
        .failures
        .iter()
        .map(|f| f.rule_id.clone())
        .collect();
    let rag_ids: BTreeSet<String> = rag.failures.iter().map(|f| f.rule_id.clone()).collect();

    let common: Vec<String> = json_ids.intersection(&rag_ids).cloned().collect();
    let union_len = json_ids.union(&rag_ids).count();

    let delta = ComparisonDelta {
        json_only: json_ids.difference(&rag_ids).cloned().collect(),
        rag_only: rag_ids.difference(&json_ids).cloned().collect(),
        agreement_rate: common.len() as f64 / union_len.max(1) as f64,
        common,
        avg_rag_confidence: average_confidence(&rag.failures),
        json_failure_count: json_response.failures.len(),
        rag_failure_count: rag.failures.len(),
        analysis_timestamp: Utc::now(),
    };

    let rag_by_rule: HashMap<&str, &ValidationFailure> = rag
        .failures
        .iter()
        .map(|f| (f.rule_id.as_str(), f))
        .collect();

    for failure in &mut json_response.failures {
        let Some(rag_failure) = rag_by_rule.get(failure.rule_id.as_str()) else {
            continue;
        };
        if failure.ai_explanation.is_none() {
            failure.ai_explanation = rag_failure.ai_explanation.clone();
        }
        if failure.ai_recommendation.is_none() {
            failure.ai_recommendation = rag_failure.ai_recommendation.clone();
        }
        if failure.ai_confidence.is_none() {
            failure.ai_confidence =
                Some(rag_failure.ai_confidence.unwrap_or(DEFAULT_FAILURE_CONFIDENCE));
        }
        failure
            .policy_references
            .extend(rag_failure.policy_references.iter().cloned());
        failure
            .suggested_actions
            .extend(rag_failure.suggested_actions.iter().cloned());
    }

    json_response.comparison_delta = Some(delta);
    json_response
}
