//! CMS JSON extractor (spec §4.3.2): tolerates rampant field-name drift via ordered alias lists.

use mrf_core::{Error, IntermediateRow, Result};
use serde_json::Value;
use tracing::warn;

const ITEMS_ARRAY_ALIASES: [&str; 6] = [
    "standard_charge_information",
    "charges",
    "standard_charges",
    "items",
    "chargemaster",
    "charge_information",
];
const CODE_CONTAINER_ALIASES: [&str; 6] = [
    "code_information",
    "billing_code_information",
    "billing_codes",
    "codes",
    "code_info",
    "billing_code",
];
const CODE_VALUE_ALIASES: [&str; 5] = ["code", "billing_code", "code_value", "cpt", "hcpcs"];
const CODE_TYPE_ALIASES: [&str; 4] = ["type", "code_type", "billing_code_type", "code_system"];
const GROSS_ALIASES: [&str; 8] = [
    "gross_charge",
    "gross",
    "gross_charges",
    "standard_charge",
    "charge",
    "list_price",
    "chargemaster_price",
    "maximum",
];
const CASH_ALIASES: [&str; 8] = [
    "discounted_cash",
    "discounted_cash_price",
    "cash",
    "cash_price",
    "self_pay",
    "self_pay_price",
    "minimum",
    "cash_discount",
];
const STANDARD_CHARGES_ALIASES: [&str; 2] = ["standard_charges", "charges"];
const MAX_LOGGED_ITEM_ERRORS: usize = 10;

pub fn extract_json(bytes: &[u8]) -> Result<Vec<IntermediateRow>> {
    let trimmed = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    let root: Value =
        serde_json::from_slice(trimmed).map_err(|e| Error::JsonDecodeError(e.to_string()))?;
    let items = find_items_array(&root)
        .ok_or_else(|| Error::JsonDecodeError("no items array found".to_string()))?;

    let mut out = Vec::new();
    let mut errors = 0usize;
    for item in items {
        match extract_item(item) {
            Ok(rows) => out.extend(rows),
            Err(e) => {
                errors += 1;
                if errors <= MAX_LOGGED_ITEM_ERRORS {
                    warn!(event = "json_item_parse_failed", error = %e, "skipping malformed item");
                }
            }
        }
    }
    Ok(out)
}

/// Finds the items array, trying each alias in order, then a root-level array (spec §4.3.2,
/// including the large-file path's candidate-path priority order).
fn find_items_array(root: &Value) -> Option<&Vec<Value>> {
    if let Value::Array(arr) = root {
        return Some(arr);
    }
    let obj = root.as_object()?;
    for alias in ITEMS_ARRAY_ALIASES {
        if let Some(Value::Array(arr)) = obj.get(alias) {
            return Some(arr);
        }
    }
    None
}

fn first_alias<'a>(obj: &'a serde_json::Map<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    aliases.iter().find_map(|a| obj.get(*a))
}

fn extract_item(item: &Value) -> Result<Vec<IntermediateRow>> {
    let obj = item
        .as_object()
        .ok_or_else(|| Error::JsonDecodeError("item is not an object".to_string()))?;

    let codes = extract_codes(obj)?;
    if codes.is_empty() {
        return Ok(Vec::new());
    }

    let (gross, cash) = extract_prices(obj);

    Ok(codes
        .into_iter()
        .map(|(code, vocab)| IntermediateRow {
            vocabulary_id: vocab,
            concept_code: code,
            gross,
            cash,
        })
        .collect())
}

fn extract_codes(obj: &serde_json::Map<String, Value>) -> Result<Vec<(String, String)>> {
    let container = first_alias(obj, &CODE_CONTAINER_ALIASES);
    let owned_entries: Vec<Value>;
    let entries: Vec<&Value> = match container {
        Some(Value::Array(arr)) => arr.iter().collect(),
        Some(v @ Value::Object(_)) => vec![v],
        // No code-container alias present: the item itself may carry code fields directly.
        _ => {
            owned_entries = vec![Value::Object(obj.clone())];
            owned_entries.iter().collect()
        }
    };

    let mut out = Vec::new();
    for entry in entries {
        let Some(entry_obj) = entry.as_object() else {
            continue;
        };
        let Some(code_value) = first_alias(entry_obj, &CODE_VALUE_ALIASES) else {
            continue;
        };
        let code = match code_value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => continue,
        };
        let Some(type_value) = first_alias(entry_obj, &CODE_TYPE_ALIASES) else {
            continue;
        };
        let Some(type_str) = type_value.as_str() else {
            continue;
        };
        let normalized_type = type_str.to_ascii_uppercase().replace('-', "");
        let vocab = match normalized_type.as_str() {
            "CPT" | "CPT4" => "cpt",
            "HCPCS" | "HCPC" => "hcpcs",
            _ => continue,
        };
        out.push((code, vocab.to_string()));
    }
    Ok(out)
}

fn extract_prices(obj: &serde_json::Map<String, Value>) -> (Option<f64>, Option<f64>) {
    let mut gross = first_alias(obj, &GROSS_ALIASES).and_then(value_to_f64);
    let mut cash = first_alias(obj, &CASH_ALIASES).and_then(value_to_f64);

    if gross.is_none() || cash.is_none() {
        if let Some(charges) = first_alias(obj, &STANDARD_CHARGES_ALIASES) {
            let candidates: Vec<&Value> = match charges {
                Value::Array(arr) => arr.iter().collect(),
                Value::Object(_) => vec![charges],
                _ => Vec::new(),
            };
            for c in candidates {
                let Some(c_obj) = c.as_object() else { continue };
                if gross.is_none() {
                    gross = first_alias(c_obj, &GROSS_ALIASES).and_then(value_to_f64);
                }
                if cash.is_none() {
                    cash = first_alias(c_obj, &CASH_ALIASES).and_then(value_to_f64);
                }
            }
        }
    }
    (gross, cash)
}

fn value_to_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => crate::normalizer::clean_price_str(s),
        _ => None,
    }
}
