//! Built-in `transform` connectors.
//!
//! Pure functions over already-materialized prior results; no external I/O.
//! Each reads its input array from `input` in the config, or from `items`
//! when running as a batch of a parallel step.

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};

use super::{Connector, ConnectorError, ConnectorOutput};

fn input_value(config: &Value) -> Result<&Value, ConnectorError> {
    config
        .get("items")
        .or_else(|| config.get("input"))
        .ok_or_else(|| ConnectorError::permanent("transform config requires 'input' or 'items'"))
}

fn array_field<'a>(config: &'a Value, field: &str) -> Result<&'a Vec<Value>, ConnectorError> {
    let value = if field == "input" {
        input_value(config)?
    } else {
        config
            .get(field)
            .ok_or_else(|| ConnectorError::permanent(format!("transform config requires '{field}'")))?
    };
    value
        .as_array()
        .ok_or_else(|| ConnectorError::permanent(format!("'{field}' must be an array")))
}

fn str_field<'a>(config: &'a Value, field: &str) -> Result<&'a str, ConnectorError> {
    config
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ConnectorError::permanent(format!("transform config requires string '{field}'")))
}

/// Returns its input unchanged.
pub struct PassthroughTransform;

impl Connector for PassthroughTransform {
    fn name(&self) -> &str {
        "transform.passthrough"
    }

    async fn invoke(&self, config: &Value) -> Result<ConnectorOutput, ConnectorError> {
        Ok(ConnectorOutput::new(input_value(config)?.clone()))
    }
}

/// Keeps items whose `field` equals `equals`.
pub struct FilterTransform;

impl Connector for FilterTransform {
    fn name(&self) -> &str {
        "transform.filter"
    }

    async fn invoke(&self, config: &Value) -> Result<ConnectorOutput, ConnectorError> {
        let items = array_field(config, "input")?;
        let field = str_field(config, "field")?;
        let expected = config
            .get("equals")
            .ok_or_else(|| ConnectorError::permanent("filter requires 'equals'"))?;

        let kept: Vec<Value> = items
            .iter()
            .filter(|item| item.get(field) == Some(expected))
            .cloned()
            .collect();
        Ok(ConnectorOutput::new(Value::Array(kept)))
    }
}

/// Inner join of `left` and `right` on `on`. Left fields win on collision.
pub struct JoinTransform;

impl Connector for JoinTransform {
    fn name(&self) -> &str {
        "transform.join"
    }

    async fn invoke(&self, config: &Value) -> Result<ConnectorOutput, ConnectorError> {
        let left = array_field(config, "left")?;
        let right = array_field(config, "right")?;
        let key = str_field(config, "on")?;

        let mut joined = Vec::new();
        for l in left {
            let Some(l_key) = l.get(key) else { continue };
            for r in right.iter().filter(|r| r.get(key) == Some(l_key)) {
                let mut merged: Map<String, Value> = r.as_object().cloned().unwrap_or_default();
                if let Some(l_obj) = l.as_object() {
                    merged.extend(l_obj.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                joined.push(Value::Object(merged));
            }
        }
        Ok(ConnectorOutput::new(Value::Array(joined)))
    }
}

/// `count` or `sum` over the input, optionally grouped by a field.
pub struct AggregateTransform;

impl Connector for AggregateTransform {
    fn name(&self) -> &str {
        "transform.aggregate"
    }

    async fn invoke(&self, config: &Value) -> Result<ConnectorOutput, ConnectorError> {
        let items = array_field(config, "input")?;
        let op = str_field(config, "op")?;
        let field = config.get("field").and_then(Value::as_str);
        if op == "sum" && field.is_none() {
            return Err(ConnectorError::permanent("aggregate 'sum' requires 'field'"));
        }
        if op != "sum" && op != "count" {
            return Err(ConnectorError::permanent(format!(
                "unsupported aggregate op '{op}' (expected count or sum)"
            )));
        }

        let contribution = |item: &Value| -> f64 {
            match field {
                Some(f) if op == "sum" => item.get(f).and_then(Value::as_f64).unwrap_or(0.0),
                _ => 1.0,
            }
        };

        match config.get("group_by").and_then(Value::as_str) {
            None => {
                let total: f64 = items.iter().map(contribution).sum();
                Ok(ConnectorOutput::with_count(json!({ "value": number(total) }), 1))
            }
            Some(group_field) => {
                let mut groups: BTreeMap<String, f64> = BTreeMap::new();
                for item in items {
                    let group = match item.get(group_field) {
                        Some(Value::String(s)) => s.clone(),
                        Some(Value::Null) | None => "null".to_string(),
                        Some(other) => other.to_string(),
                    };
                    *groups.entry(group).or_default() += contribution(item);
                }
                let count = groups.len() as u64;
                let data: Map<String, Value> =
                    groups.into_iter().map(|(k, v)| (k, number(v))).collect();
                Ok(ConnectorOutput::with_count(Value::Object(data), count))
            }
        }
    }
}

/// Integral values render as integers.
fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9_007_199_254_740_992.0 {
        json!(value as i64)
    } else {
        json!(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passthrough_prefers_batch_items() {
        let out = PassthroughTransform
            .invoke(&json!({ "input": [1], "items": [2, 3] }))
            .await
            .unwrap();
        assert_eq!(out.data, json!([2, 3]));
        assert_eq!(out.item_count, 2);
    }

    #[tokio::test]
    async fn passthrough_without_input_is_permanent_error() {
        let err = PassthroughTransform.invoke(&json!({})).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn filter_keeps_matching_items() {
        let out = FilterTransform
            .invoke(&json!({
                "input": [{"tier": "a"}, {"tier": "b"}, {"tier": "a"}],
                "field": "tier",
                "equals": "a"
            }))
            .await
            .unwrap();
        assert_eq!(out.item_count, 2);
    }

    #[tokio::test]
    async fn join_merges_on_key_left_wins() {
        let out = JoinTransform
            .invoke(&json!({
                "left": [{"id": 1, "name": "acme"}, {"id": 2, "name": "globex"}],
                "right": [{"id": 1, "name": "ignored", "score": 9}],
                "on": "id"
            }))
            .await
            .unwrap();
        assert_eq!(out.data, json!([{"id": 1, "name": "acme", "score": 9}]));
    }

    #[tokio::test]
    async fn aggregate_sum_grouped() {
        let out = AggregateTransform
            .invoke(&json!({
                "input": [
                    {"region": "eu", "amount": 2},
                    {"region": "us", "amount": 5},
                    {"region": "eu", "amount": 3}
                ],
                "op": "sum",
                "field": "amount",
                "group_by": "region"
            }))
            .await
            .unwrap();
        assert_eq!(out.data, json!({"eu": 5, "us": 5}));
        assert_eq!(out.item_count, 2);
    }

    #[tokio::test]
    async fn aggregate_count_ungrouped() {
        let out = AggregateTransform
            .invoke(&json!({ "input": [1, 2, 3], "op": "count" }))
            .await
            .unwrap();
        assert_eq!(out.data, json!({"value": 3}));
    }

    #[tokio::test]
    async fn aggregate_rejects_unknown_op() {
        let err = AggregateTransform
            .invoke(&json!({ "input": [], "op": "median" }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("median"));
    }
}
