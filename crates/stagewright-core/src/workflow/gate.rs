//! Quality gate evaluation.
//!
//! Pure predicates over a stage's `StepResult` and materialized data. The
//! evaluator only reports; the run controller applies the gate's policy.

use serde_json::Value;
use stagewright_types::gate::{GateCheck, GateOutcome, QualityGateDefinition};
use stagewright_types::run::StepResult;

/// Stateless evaluator for `QualityGateDefinition`s.
pub struct QualityGateEvaluator;

impl QualityGateEvaluator {
    /// Run every check of `gate` against the stage output, in declaration
    /// order. `failed_checks` lists the names of failing checks in that order.
    pub fn evaluate(gate: &QualityGateDefinition, result: &StepResult, data: &Value) -> GateOutcome {
        let failed_checks: Vec<String> = gate
            .checks
            .iter()
            .filter(|check| !Self::check(check, result, data))
            .map(|check| check.name().to_string())
            .collect();

        GateOutcome {
            stage: gate.stage.clone(),
            passed: failed_checks.is_empty(),
            failed_checks,
            policy: gate.policy,
        }
    }

    fn check(check: &GateCheck, result: &StepResult, data: &Value) -> bool {
        match check {
            GateCheck::MinItems { min, .. } => result.item_count >= *min,
            GateCheck::RequiredFields { fields, .. } => items(data).all(|item| {
                item.as_object()
                    .is_some_and(|obj| fields.iter().all(|f| obj.contains_key(f)))
            }),
            GateCheck::ScoreThreshold { field, min, .. } => items(data).all(|item| {
                item.get(field)
                    .and_then(Value::as_f64)
                    .is_some_and(|score| score >= *min)
            }),
            GateCheck::MaxOmittedBatches { max, .. } => result.omitted_batches.len() <= *max,
        }
    }
}

/// Array elements, or the value itself for non-array data.
fn items(data: &Value) -> Box<dyn Iterator<Item = &Value> + '_> {
    match data {
        Value::Array(items) => Box::new(items.iter()),
        Value::Null => Box::new(std::iter::empty()),
        other => Box::new(std::iter::once(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stagewright_types::gate::GatePolicy;
    use stagewright_types::run::StepStatus;

    fn result(items: u64, omitted: Vec<usize>) -> StepResult {
        let mut r = StepResult::pending("score");
        r.status = StepStatus::Succeeded;
        r.item_count = items;
        r.omitted_batches = omitted;
        r
    }

    fn gate(checks: Vec<GateCheck>) -> QualityGateDefinition {
        QualityGateDefinition {
            stage: "score".to_string(),
            checks,
            policy: GatePolicy::WarnAndContinue,
            deadline_secs: None,
        }
    }

    #[test]
    fn all_checks_pass() {
        let data = json!([{"email": "a", "score": 0.8}, {"email": "b", "score": 0.6}]);
        let outcome = QualityGateEvaluator::evaluate(
            &gate(vec![
                GateCheck::MinItems { name: None, min: 2 },
                GateCheck::RequiredFields { name: None, fields: vec!["email".into()] },
                GateCheck::ScoreThreshold { name: None, field: "score".into(), min: 0.5 },
                GateCheck::MaxOmittedBatches { name: None, max: 0 },
            ]),
            &result(2, vec![]),
            &data,
        );
        assert!(outcome.passed);
        assert!(outcome.failed_checks.is_empty());
        assert_eq!(outcome.policy, GatePolicy::WarnAndContinue);
    }

    #[test]
    fn failed_checks_reported_by_name_in_order() {
        let data = json!([{"email": "a", "score": 0.2}, {"score": 0.9}]);
        let outcome = QualityGateEvaluator::evaluate(
            &gate(vec![
                GateCheck::MinItems { name: Some("enough-leads".into()), min: 5 },
                GateCheck::RequiredFields { name: None, fields: vec!["email".into()] },
                GateCheck::ScoreThreshold { name: None, field: "score".into(), min: 0.5 },
                GateCheck::MaxOmittedBatches { name: None, max: 1 },
            ]),
            &result(2, vec![3]),
            &data,
        );
        assert!(!outcome.passed);
        assert_eq!(
            outcome.failed_checks,
            vec!["enough-leads", "required_fields", "score_threshold"]
        );
    }

    #[test]
    fn object_data_is_checked_as_single_item() {
        let outcome = QualityGateEvaluator::evaluate(
            &gate(vec![GateCheck::RequiredFields { name: None, fields: vec!["value".into()] }]),
            &result(1, vec![]),
            &json!({"value": 3}),
        );
        assert!(outcome.passed);
    }

    #[test]
    fn non_numeric_score_fails_threshold() {
        let outcome = QualityGateEvaluator::evaluate(
            &gate(vec![GateCheck::ScoreThreshold { name: None, field: "score".into(), min: 0.0 }]),
            &result(1, vec![]),
            &json!([{"score": "high"}]),
        );
        assert!(!outcome.passed);
    }

    #[test]
    fn omitted_batches_over_limit() {
        let outcome = QualityGateEvaluator::evaluate(
            &gate(vec![GateCheck::MaxOmittedBatches { name: None, max: 1 }]),
            &result(10, vec![0, 2]),
            &json!([]),
        );
        assert_eq!(outcome.failed_checks, vec!["max_omitted_batches"]);
    }
}
