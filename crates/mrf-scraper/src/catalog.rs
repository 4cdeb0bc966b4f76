//! Catalog loader (spec §4.7): reads `dim/urls/<state>.json` (one file per state, lowercase
//! filename) and turns raw rows into `HospitalRecord`s, applying optional state/CCN filters.

use anyhow::{Context, Result};
use mrf_core::{ColumnHints, ExtractorKind, HospitalRecord};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    ccn: String,
    hospital_name: String,
    address: Option<String>,
    file_url: Option<String>,
    transparency_page: Option<String>,
    npi: Option<String>,
    idn: Option<String>,
    extractor: Option<String>,
    #[serde(default)]
    format_hint: Option<String>,
    #[serde(default)]
    column_hints: Option<ColumnHints>,
}

/// Reads one state's catalog file. Rows missing either `ccn` or `file_url` are dropped (spec
/// §4.7): they cannot be scraped, and are not hospitals this run tracks at all.
pub fn load_state_file(dim_dir: &Path, state: &str) -> Result<Vec<HospitalRecord>> {
    let path = dim_dir.join("urls").join(format!("{}.json", state.to_ascii_lowercase()));
    let bytes = std::fs::read(&path).with_context(|| format!("reading catalog file {}", path.display()))?;
    let entries: Vec<CatalogEntry> =
        serde_json::from_slice(&bytes).with_context(|| format!("parsing catalog file {}", path.display()))?;

    let state_upper = state.to_ascii_uppercase();
    Ok(entries
        .into_iter()
        .filter_map(|e| {
            let file_url = e.file_url?;
            if file_url.is_empty() {
                return None;
            }
            Some(HospitalRecord {
                ccn: e.ccn,
                hospital_name: e.hospital_name,
                state: state_upper.clone(),
                file_url,
                transparency_page: e.transparency_page,
                address: e.address,
                npi: e.npi,
                idn: e.idn,
                format_hint: e.format_hint,
                extractor_override: e.extractor.as_deref().and_then(ExtractorKind::parse),
                column_hints: e.column_hints,
            })
        })
        .collect())
}

/// Lists the available state codes by scanning `dim/urls/*.json` filenames.
pub fn list_states(dim_dir: &Path) -> Result<Vec<String>> {
    let urls_dir = dim_dir.join("urls");
    let mut states = Vec::new();
    for entry in std::fs::read_dir(&urls_dir).with_context(|| format!("reading {}", urls_dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            states.push(stem.to_ascii_uppercase());
        }
    }
    states.sort();
    Ok(states)
}

/// Loads hospital records for a run: every state, or a single state, optionally narrowed to one
/// CCN (spec §4.6/§4.7).
pub fn load(dim_dir: &Path, state: Option<&str>, ccn: Option<&str>) -> Result<Vec<HospitalRecord>> {
    let states = match state {
        Some(s) => vec![s.to_ascii_uppercase()],
        None => list_states(dim_dir)?,
    };

    let mut records = Vec::new();
    for s in states {
        let mut loaded = load_state_file(dim_dir, &s)
            .with_context(|| format!("loading catalog for state {s}"))?;
        records.append(&mut loaded);
    }

    if let Some(ccn) = ccn {
        records.retain(|r| r.ccn == ccn);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_catalog(dir: &Path, state: &str, json: &str) {
        let urls_dir = dir.join("urls");
        std::fs::create_dir_all(&urls_dir).unwrap();
        let mut f = std::fs::File::create(urls_dir.join(format!("{state}.json"))).unwrap();
        f.write_all(json.as_bytes()).unwrap();
    }

    #[test]
    fn loads_entries_with_ccn_and_file_url() {
        let dir = tempfile::tempdir().unwrap();
        write_catalog(
            dir.path(),
            "tx",
            r#"[{"ccn":"450001","hospital_name":"Test","file_url":"https://example.com/a.csv"}]"#,
        );
        let records = load_state_file(dir.path(), "tx").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, "TX");
        assert_eq!(records[0].ccn, "450001");
    }

    #[test]
    fn entries_missing_file_url_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        write_catalog(
            dir.path(),
            "tx",
            r#"[{"ccn":"450001","hospital_name":"Test"}]"#,
        );
        let records = load_state_file(dir.path(), "tx").unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn format_hint_and_column_hints_are_carried_onto_the_record() {
        let dir = tempfile::tempdir().unwrap();
        write_catalog(
            dir.path(),
            "tx",
            r#"[{"ccn":"450001","hospital_name":"Test","file_url":"https://example.com/a.dat",
                "format_hint":"csv","column_hints":{"gross_column":"gross","cash_column":"cash","header_skip":2}}]"#,
        );
        let records = load_state_file(dir.path(), "tx").unwrap();
        assert_eq!(records[0].format_hint.as_deref(), Some("csv"));
        let hints = records[0].column_hints.as_ref().unwrap();
        assert_eq!(hints.gross_column.as_deref(), Some("gross"));
        assert_eq!(hints.header_skip, Some(2));
    }

    #[test]
    fn list_states_scans_catalog_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_catalog(dir.path(), "tx", "[]");
        write_catalog(dir.path(), "ca", "[]");
        let states = list_states(dir.path()).unwrap();
        assert_eq!(states, vec!["CA".to_string(), "TX".to_string()]);
    }

    #[test]
    fn load_filters_by_ccn_across_states() {
        let dir = tempfile::tempdir().unwrap();
        write_catalog(
            dir.path(),
            "tx",
            r#"[{"ccn":"450001","hospital_name":"A","file_url":"https://example.com/a.csv"},
               {"ccn":"450002","hospital_name":"B","file_url":"https://example.com/b.csv"}]"#,
        );
        let records = load(dir.path(), Some("tx"), Some("450002")).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ccn, "450002");
    }
}
