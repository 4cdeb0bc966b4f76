//! Extractor registry (spec §4.4): a flat, ordered priority lookup, not a trait-object hierarchy.
//! Each rule either matches or falls through to the next; the first match wins.

use mrf_core::{ExtractorKind, HospitalRecord};
use regex::Regex;
use std::sync::OnceLock;

/// CCN overrides: empty by default, reserved for per-hospital patches discovered after a run.
const CCN_OVERRIDES: &[(&str, ExtractorKind)] = &[];

/// IDN label overrides: small, reserved for catalog rows carrying network labels.
const IDN_OVERRIDES: &[(&str, ExtractorKind)] = &[];

struct UrlRule {
    pattern: &'static str,
    is_regex: bool,
    extractor: ExtractorKind,
}

const URL_RULES: &[UrlRule] = &[
    UrlRule { pattern: r"claraprice\.net.*machine-readable", is_regex: true, extractor: ExtractorKind::Json },
    UrlRule { pattern: r"craneware\.com/api-pricing-transparency", is_regex: true, extractor: ExtractorKind::Csv },
    UrlRule { pattern: "sthpiprd.blob.core.windows.net", is_regex: false, extractor: ExtractorKind::Csv },
    UrlRule { pattern: "pricetransparency.accureg.net", is_regex: false, extractor: ExtractorKind::Csv },
    UrlRule { pattern: "uhsfilecdn.eskycity.net", is_regex: false, extractor: ExtractorKind::Csv },
    UrlRule { pattern: "encompasshealth.com", is_regex: false, extractor: ExtractorKind::Csv },
    UrlRule { pattern: "edge.sitecorecloud.io/encompasshee", is_regex: false, extractor: ExtractorKind::Csv },
    UrlRule { pattern: "resources.selectmedical.com", is_regex: false, extractor: ExtractorKind::Csv },
    UrlRule { pattern: "panaceainc.com", is_regex: false, extractor: ExtractorKind::Zip },
    UrlRule { pattern: r"sun(behavioral|delaware)\.com.*\.xlsx", is_regex: true, extractor: ExtractorKind::Xlsx },
    UrlRule { pattern: "www.hcadam.com/api/public/content", is_regex: false, extractor: ExtractorKind::Json },
    UrlRule { pattern: "machine-readable-files.com", is_regex: false, extractor: ExtractorKind::Csv },
    UrlRule { pattern: r"centaurihs\.com/ptapp/api/cdm/export", is_regex: true, extractor: ExtractorKind::Csv },
    UrlRule { pattern: "res.cloudinary.com/dpmykpsih", is_regex: false, extractor: ExtractorKind::Csv },
    UrlRule { pattern: "apps.para-hcfs.com", is_regex: false, extractor: ExtractorKind::Csv },
    UrlRule { pattern: "hospitalpricedisclosure.com", is_regex: false, extractor: ExtractorKind::Json },
    UrlRule { pattern: "drive.google.com", is_regex: false, extractor: ExtractorKind::Csv },
];

fn compiled_regexes() -> &'static Vec<(Regex, ExtractorKind)> {
    static CACHE: OnceLock<Vec<(Regex, ExtractorKind)>> = OnceLock::new();
    CACHE.get_or_init(|| {
        URL_RULES
            .iter()
            .filter(|r| r.is_regex)
            .map(|r| {
                (
                    Regex::new(&format!("(?i){}", r.pattern)).expect("url rule regex must compile"),
                    r.extractor,
                )
            })
            .collect()
    })
}

/// Implements the five-level priority lookup of spec §4.4: explicit override, CCN table,
/// URL-pattern table, IDN table, file-extension fallback. A catalog-supplied `format_hint` is
/// consulted only once all five are exhausted, so it never preempts a URL/extension-based match
/// the registry already trusts more.
pub fn select_extractor(record: &HospitalRecord) -> Option<ExtractorKind> {
    if let Some(kind) = record.extractor_override {
        return Some(kind);
    }

    if let Some((_, kind)) = CCN_OVERRIDES.iter().find(|(ccn, _)| *ccn == record.ccn) {
        return Some(*kind);
    }

    if let Some(kind) = match_url_pattern(&record.file_url) {
        return Some(kind);
    }

    if let Some(idn) = &record.idn {
        if let Some((_, kind)) = IDN_OVERRIDES.iter().find(|(label, _)| label == idn) {
            return Some(*kind);
        }
    }

    if let Some(kind) = extractor_from_extension(&record.file_url) {
        return Some(kind);
    }

    record.format_hint.as_deref().and_then(ExtractorKind::parse)
}

fn match_url_pattern(url: &str) -> Option<ExtractorKind> {
    let lower = url.to_ascii_lowercase();
    for rule in URL_RULES {
        if rule.is_regex {
            continue;
        }
        if lower.contains(rule.pattern) {
            return Some(rule.extractor);
        }
    }
    for (re, kind) in compiled_regexes() {
        if re.is_match(url) {
            return Some(*kind);
        }
    }
    None
}

fn extractor_from_extension(url: &str) -> Option<ExtractorKind> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".json") {
        Some(ExtractorKind::Json)
    } else if lower.ends_with(".csv") {
        Some(ExtractorKind::Csv)
    } else if lower.ends_with(".xlsx") || lower.ends_with(".xls") {
        Some(ExtractorKind::Xlsx)
    } else if lower.ends_with(".zip") {
        Some(ExtractorKind::Zip)
    } else {
        // .xml and anything else: unsupported, registry miss.
        None
    }
}
