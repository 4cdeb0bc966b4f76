//! Normalizer (spec §4.5): converts raw intermediate rows into the canonical, sorted,
//! de-duplicated sequence of `(code, kind, price)` output rows.

use crate::vocab::VocabularyIndex;
use mrf_core::{IntermediateRow, PriceKind, PriceRecord};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

fn code_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(mrf_core::CODE_PATTERN).unwrap())
}

/// Strip one leading zero iff the code is exactly six characters and begins with `0` (step 1).
fn strip_leading_zero(code: &str) -> String {
    if code.len() == 6 && code.starts_with('0') {
        code[1..].to_string()
    } else {
        code.to_string()
    }
}

/// Strip `$` and thousands separators, then parse to `f64`; `None` on failure (step 2).
fn clean_price(raw: Option<f64>) -> Option<f64> {
    raw
}

/// Same cleaning rule applied to a raw string price, used by extractors before rows reach the
/// normalizer and exercised directly here for the boundary behaviors in spec §8.
pub fn clean_price_str(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| *c != '$' && *c != ',')
        .collect();
    cleaned.parse::<f64>().ok()
}

#[derive(Debug, Clone, Default)]
struct Group {
    gross: Option<f64>,
    cash: Option<f64>,
}

/// Runs the full 9-step pipeline and returns the canonical, sorted, de-duplicated output rows.
/// A completely empty result (after vocabulary filtering) signals `NoCharges` to the caller, which
/// is responsible for surfacing that as a worker failure per spec §7.
pub fn normalize(rows: &[IntermediateRow], vocabulary: &VocabularyIndex) -> Vec<PriceRecord> {
    let mut groups: BTreeMap<(String, String), Group> = BTreeMap::new();

    for row in rows {
        // step 1: strip a single padding zero on six-char codes.
        let code = strip_leading_zero(row.concept_code.trim());

        // step 2: clean already-numeric prices (string cleaning happens in extractors; this is
        // the pass-through point for rows that arrive pre-parsed).
        let gross = clean_price(row.gross);
        let cash = clean_price(row.cash);

        // step 3: lowercase and restrict the vocabulary id.
        let vocab_id = row.vocabulary_id.to_ascii_lowercase();
        if !matches!(vocab_id.as_str(), "cpt" | "cpt4" | "hcpcs") {
            continue;
        }

        // step 4: inner-join against the vocabulary index.
        if !vocabulary.contains(&code) {
            continue;
        }

        // step 5: group by (vocabulary_id, concept_code), keeping the element-wise maximum.
        let entry = groups.entry((vocab_id, code)).or_default();
        entry.gross = max_option(entry.gross, gross);
        entry.cash = max_option(entry.cash, cash);
    }

    let mut out = Vec::new();
    for ((_, code), group) in groups {
        // step 6: reshape wide -> long, one candidate row per kind.
        for (kind, price) in [(PriceKind::Gross, group.gross), (PriceKind::Cash, group.cash)] {
            // step 7: drop nulls and non-positive prices; round remaining to 2dp.
            let Some(price) = price else { continue };
            if price <= 0.0 {
                continue;
            }
            let rounded = (price * 100.0).round() / 100.0;

            // step 8: validate the code shape; drop invalids.
            if !code_pattern().is_match(&code) {
                continue;
            }

            out.push(PriceRecord {
                code: code.clone(),
                kind,
                price: rounded,
            });
        }
    }

    // step 9: stable sort by (code, kind).
    out.sort_by(|a, b| a.code.cmp(&b.code).then(a.kind.cmp(&b.kind)));
    out
}

fn max_option(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (Some(x), None) => Some(x),
        (None, Some(y)) => Some(y),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> VocabularyIndex {
        VocabularyIndex::from_codes(["99213".to_string(), "99214".to_string()])
    }

    #[test]
    fn scenario_1_cms_csv_two_rows() {
        let rows = vec![
            IntermediateRow {
                vocabulary_id: "CPT".into(),
                concept_code: "99213".into(),
                gross: Some(100.0),
                cash: Some(80.0),
            },
            IntermediateRow {
                vocabulary_id: "CPT".into(),
                concept_code: "99214".into(),
                gross: Some(150.0),
                cash: Some(120.0),
            },
        ];
        let out = normalize(&rows, &vocab());
        assert_eq!(out.len(), 4);
        assert_eq!(out[0].code, "99213");
        assert_eq!(out[0].kind, PriceKind::Gross);
        assert_eq!(out[0].price, 100.0);
        assert_eq!(out[1].code, "99213");
        assert_eq!(out[1].kind, PriceKind::Cash);
        assert_eq!(out[1].price, 80.0);
        assert_eq!(out[2].code, "99214");
        assert_eq!(out[3].code, "99214");
    }

    #[test]
    fn scenario_6_duplicate_codes_collapse_to_max() {
        let rows = vec![
            IntermediateRow {
                vocabulary_id: "CPT".into(),
                concept_code: "99213".into(),
                gross: Some(100.0),
                cash: Some(80.0),
            },
            IntermediateRow {
                vocabulary_id: "CPT".into(),
                concept_code: "99213".into(),
                gross: Some(120.0),
                cash: Some(70.0),
            },
        ];
        let out = normalize(&rows, &vocab());
        assert_eq!(out.len(), 2);
        let gross = out.iter().find(|r| r.kind == PriceKind::Gross).unwrap();
        let cash = out.iter().find(|r| r.kind == PriceKind::Cash).unwrap();
        assert_eq!(gross.price, 120.0);
        assert_eq!(cash.price, 80.0);
    }

    #[test]
    fn six_char_zero_padded_code_normalizes() {
        let rows = vec![IntermediateRow {
            vocabulary_id: "CPT".into(),
            concept_code: "099213".into(),
            gross: Some(50.0),
            cash: None,
        }];
        let out = normalize(&rows, &vocab());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].code, "99213");
    }

    #[test]
    fn zero_and_negative_prices_are_dropped() {
        let rows = vec![IntermediateRow {
            vocabulary_id: "CPT".into(),
            concept_code: "99213".into(),
            gross: Some(0.0),
            cash: Some(-5.0),
        }];
        let out = normalize(&rows, &vocab());
        assert!(out.is_empty());
    }

    #[test]
    fn codes_outside_vocabulary_are_dropped() {
        let rows = vec![IntermediateRow {
            vocabulary_id: "CPT".into(),
            concept_code: "00000".into(),
            gross: Some(100.0),
            cash: None,
        }];
        let out = normalize(&rows, &vocab());
        assert!(out.is_empty());
    }

    #[test]
    fn unknown_vocabulary_ids_are_dropped() {
        let rows = vec![IntermediateRow {
            vocabulary_id: "ICD10".into(),
            concept_code: "99213".into(),
            gross: Some(100.0),
            cash: None,
        }];
        let out = normalize(&rows, &vocab());
        assert!(out.is_empty());
    }

    #[test]
    fn normalizer_is_idempotent_on_its_own_output() {
        let rows = vec![
            IntermediateRow {
                vocabulary_id: "CPT".into(),
                concept_code: "99213".into(),
                gross: Some(100.0),
                cash: Some(80.0),
            },
            IntermediateRow {
                vocabulary_id: "CPT".into(),
                concept_code: "99214".into(),
                gross: Some(150.0),
                cash: Some(120.0),
            },
        ];
        let once = normalize(&rows, &vocab());
        let round_tripped: Vec<IntermediateRow> = once
            .iter()
            .map(|r| IntermediateRow {
                vocabulary_id: "cpt".into(),
                concept_code: r.code.clone(),
                gross: if r.kind == PriceKind::Gross {
                    Some(r.price)
                } else {
                    None
                },
                cash: if r.kind == PriceKind::Cash {
                    Some(r.price)
                } else {
                    None
                },
            })
            .collect();
        let twice = normalize(&round_tripped, &vocab());
        assert_eq!(once, twice);
    }

    #[test]
    fn clean_price_str_handles_currency_formatting_and_na() {
        assert_eq!(clean_price_str("$1,234.56"), Some(1234.56));
        assert_eq!(clean_price_str("N/A"), None);
    }

    proptest::proptest! {
        #[test]
        fn strip_leading_zero_never_panics_and_only_shortens_six_char_zero_prefixed(
            code in "[0-9A-Za-z]{1,10}"
        ) {
            let stripped = strip_leading_zero(&code);
            if code.len() == 6 && code.starts_with('0') {
                proptest::prop_assert_eq!(stripped.len(), 5);
            } else {
                proptest::prop_assert_eq!(stripped, code);
            }
        }
    }
}
