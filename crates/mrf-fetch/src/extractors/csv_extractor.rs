//! CMS CSV extractor (spec §4.3.1): the published CMS v2/v3 tabular schema plus several vendor
//! dialects.

use crate::archive::{decode_with_fallback, detect_delimiter, is_zip, looks_like_html, pick_member};
use mrf_core::{ColumnHints, Error, IntermediateRow, Result};
use std::collections::HashSet;
use std::path::Path;

const CHUNK_ROWS: usize = 50_000;
const VALID_CODE_TYPES: [&str; 3] = ["CPT", "CPT4", "HCPCS"];

/// Entry point: obtain already-fetched bytes (possibly a ZIP or HTML in disguise) and produce the
/// uniform intermediate table. `hints` are a catalog row's optional column-mapping overrides
/// (spec §3); `None` falls back entirely to the heuristics below.
pub fn extract_csv(bytes: &[u8], hints: Option<&ColumnHints>) -> Result<Vec<IntermediateRow>> {
    if is_zip(bytes) {
        let names = crate::archive::member_names(bytes)?;
        let name_refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let (member, kind) = pick_member(&name_refs)
            .ok_or_else(|| Error::BadZipFile("zip has no CSV or JSON member".to_string()))?;
        let extracted = crate::archive::extract_member(bytes, member)?;
        return match kind {
            crate::archive::MemberKind::Csv => extract_csv(&extracted, hints),
            crate::archive::MemberKind::Json => super::json_extractor::extract_json(&extracted),
        };
    }
    if looks_like_html(bytes) {
        return Err(Error::HtmlInsteadOfData);
    }
    let text = decode_with_fallback(bytes);
    parse_table(&text, hints)
}

/// Streams a large file in fixed-size row chunks (spec §4.3.1 large-file path). The temp file at
/// `path` is the caller's responsibility; this function only reads it.
pub fn extract_csv_from_file_chunked(path: &Path, hints: Option<&ColumnHints>) -> Result<Vec<IntermediateRow>> {
    let bytes = std::fs::read(path).map_err(|e| Error::Io(e.to_string()))?;
    if is_zip(&bytes) {
        return extract_csv(&bytes, hints);
    }
    if looks_like_html(&bytes) {
        return Err(Error::HtmlInsteadOfData);
    }
    let text = decode_with_fallback(&bytes);
    let delimiter = detect_delimiter(&text);
    let header_skip = resolve_header_skip(&text, delimiter, hints);

    let mut lines = text.lines().skip(header_skip);
    let Some(header_line) = lines.next() else {
        return Ok(Vec::new());
    };
    let headers = normalize_headers(header_line, delimiter);
    let cols = CodeColumns::detect(&headers, hints);

    let mut out = Vec::new();
    let mut batch: Vec<&str> = Vec::with_capacity(CHUNK_ROWS);
    for line in lines {
        batch.push(line);
        if batch.len() >= CHUNK_ROWS {
            out.extend(parse_rows(&headers, &cols, delimiter, &batch, hints));
            batch.clear();
        }
    }
    if !batch.is_empty() {
        out.extend(parse_rows(&headers, &cols, delimiter, &batch, hints));
    }
    Ok(out)
}

fn parse_table(text: &str, hints: Option<&ColumnHints>) -> Result<Vec<IntermediateRow>> {
    let delimiter = detect_delimiter(text);
    let header_skip = resolve_header_skip(text, delimiter, hints);

    let mut lines = text.lines().skip(header_skip);
    let Some(header_line) = lines.next() else {
        return Ok(Vec::new());
    };
    let headers = normalize_headers(header_line, delimiter);
    let cols = CodeColumns::detect(&headers, hints);

    let remaining: Vec<&str> = lines.collect();
    Ok(parse_rows(&headers, &cols, delimiter, &remaining, hints))
}

/// A catalog-supplied `header_skip` hint wins outright; otherwise falls back to the sniffing
/// heuristic below.
fn resolve_header_skip(text: &str, delimiter: u8, hints: Option<&ColumnHints>) -> usize {
    hints
        .and_then(|h| h.header_skip)
        .unwrap_or_else(|| decide_header_skip(text, delimiter))
}

/// Decide how many header rows to skip by inspecting the first line (spec §4.3.1 step 4).
fn decide_header_skip(text: &str, delimiter: u8) -> usize {
    let Some(first_line) = text.lines().next() else {
        return 0;
    };
    let normalized = first_line.to_ascii_lowercase();
    if delimiter == b'|' {
        return 0;
    }
    if normalized.contains("service_code") || normalized.contains("hcpcs") {
        return 0;
    }
    if normalized.contains("hospital_name") {
        return 2;
    }
    0
}

/// Collapse whitespace around `|` separators so `code | 1 | type` and `code|1|type` compare equal
/// (spec §4.3.1 step 6), then split on `delimiter`.
fn normalize_headers(header_line: &str, delimiter: u8) -> Vec<String> {
    // Only collapse `|`-adjacent whitespace in CMS-style column names (e.g. `code | 1 | type`);
    // when `|` is itself the field delimiter (vendor dialect) it must not be touched.
    let line = if delimiter == b'|' {
        header_line.to_string()
    } else {
        collapse_pipe_whitespace(header_line)
    };
    split_record(&line, delimiter)
        .into_iter()
        .map(|h| h.trim().trim_matches('"').to_ascii_lowercase())
        .collect()
}

fn pipe_whitespace_re() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"\s*\|\s*").unwrap())
}

fn collapse_pipe_whitespace(s: &str) -> String {
    pipe_whitespace_re().replace_all(s, "|").into_owned()
}

fn split_record(line: &str, delimiter: u8) -> Vec<String> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(line.as_bytes());
    if let Some(Ok(record)) = rdr.records().next() {
        record.iter().map(|s| s.to_string()).collect()
    } else {
        line.split(delimiter as char).map(|s| s.to_string()).collect()
    }
}

#[derive(Debug, Clone)]
enum CodeColumns {
    /// `(value_col_idx, type_col_idx)` pairs for `code|N` / `code|N|type` (spec CMS mode).
    Cms(Vec<(usize, usize)>),
    /// `(col_idx, fixed_kind)` for a literal vendor column name (Craneware/vendor mode).
    Vendor(Vec<(usize, String)>),
    /// A single lone `code` column (minimal mode).
    Minimal(usize),
    /// A catalog-supplied `code_column` name resolved to a header index. Trusted outright: unlike
    /// `Minimal`, it skips the five-digit-numeric gate, since the hint author already knows it's
    /// a code column.
    Hinted(usize),
    None,
}

impl CodeColumns {
    fn detect(headers: &[String], hints: Option<&ColumnHints>) -> Self {
        if let Some(name) = hints.and_then(|h| h.code_column.as_deref()) {
            let target = name.trim().to_ascii_lowercase();
            if let Some(idx) = headers.iter().position(|h| h == &target) {
                return CodeColumns::Hinted(idx);
            }
        }

        let mut cms_pairs = Vec::new();
        for n in 1..=9 {
            let value_name = format!("code|{n}");
            let type_name = format!("code|{n}|type");
            if let (Some(vi), Some(ti)) = (
                headers.iter().position(|h| h == &value_name),
                headers.iter().position(|h| h == &type_name),
            ) {
                cms_pairs.push((vi, ti));
            }
        }
        if !cms_pairs.is_empty() {
            return CodeColumns::Cms(cms_pairs);
        }

        let mut vendor_cols = Vec::new();
        for (idx, h) in headers.iter().enumerate() {
            match h.as_str() {
                "hcpcs" | "medicare_hcpcs" => vendor_cols.push((idx, "hcpcs".to_string())),
                "cpt" | "cpt4" => vendor_cols.push((idx, "cpt".to_string())),
                _ => {}
            }
        }
        if !vendor_cols.is_empty() {
            return CodeColumns::Vendor(vendor_cols);
        }

        if let Some(idx) = headers.iter().position(|h| h == "code") {
            return CodeColumns::Minimal(idx);
        }

        CodeColumns::None
    }

    fn column_indices(&self) -> HashSet<usize> {
        match self {
            CodeColumns::Cms(pairs) => pairs.iter().flat_map(|&(v, t)| [v, t]).collect(),
            CodeColumns::Vendor(cols) => cols.iter().map(|&(i, _)| i).collect(),
            CodeColumns::Minimal(idx) | CodeColumns::Hinted(idx) => [*idx].into_iter().collect(),
            CodeColumns::None => HashSet::new(),
        }
    }
}

fn parse_rows(
    headers: &[String],
    cols: &CodeColumns,
    delimiter: u8,
    lines: &[&str],
    hints: Option<&ColumnHints>,
) -> Vec<IntermediateRow> {
    if matches!(cols, CodeColumns::None) {
        return Vec::new();
    }
    let code_col_indices = cols.column_indices();
    let mut out = Vec::new();

    for line in lines {
        let fields = split_record(line, delimiter);
        let codes = extract_codes(headers, cols, &fields);
        if codes.is_empty() {
            continue;
        }
        let (gross, cash) = pick_gross_cash(headers, &fields, &code_col_indices, hints);
        for (code, code_type) in codes {
            out.push(IntermediateRow {
                vocabulary_id: code_type,
                concept_code: code,
                gross,
                cash,
            });
        }
    }
    out
}

fn field(fields: &[String], idx: usize) -> Option<&str> {
    fields.get(idx).map(|s| s.trim())
}

fn extract_codes(_headers: &[String], cols: &CodeColumns, fields: &[String]) -> Vec<(String, String)> {
    match cols {
        CodeColumns::Cms(pairs) => pairs
            .iter()
            .filter_map(|&(vi, ti)| {
                let code = field(fields, vi)?;
                let code_type = field(fields, ti)?.to_ascii_uppercase();
                if code.is_empty() || !VALID_CODE_TYPES.contains(&code_type.as_str()) {
                    return None;
                }
                Some((code.to_string(), code_type))
            })
            .collect(),
        CodeColumns::Vendor(vendor_cols) => vendor_cols
            .iter()
            .filter_map(|(idx, kind)| {
                let code = field(fields, *idx)?;
                if code.is_empty() {
                    return None;
                }
                Some((code.to_string(), kind.clone()))
            })
            .collect(),
        CodeColumns::Minimal(idx) => {
            let code = field(fields, *idx).unwrap_or("");
            if code.len() == 5 && code.chars().all(|c| c.is_ascii_digit()) {
                vec![(code.to_string(), "cpt".to_string())]
            } else {
                Vec::new()
            }
        }
        CodeColumns::Hinted(idx) => {
            let code = field(fields, *idx).unwrap_or("");
            if code.is_empty() {
                Vec::new()
            } else {
                vec![(code.to_string(), "cpt".to_string())]
            }
        }
        CodeColumns::None => Vec::new(),
    }
}

fn header_index(headers: &[String], name: &str) -> Option<usize> {
    let target = name.trim().to_ascii_lowercase();
    headers.iter().position(|h| h == &target)
}

fn pick_gross_cash(
    headers: &[String],
    fields: &[String],
    code_col_indices: &HashSet<usize>,
    hints: Option<&ColumnHints>,
) -> (Option<f64>, Option<f64>) {
    let mut gross = hints
        .and_then(|h| h.gross_column.as_deref())
        .and_then(|name| header_index(headers, name))
        .and_then(|idx| field(fields, idx))
        .and_then(crate::normalizer::clean_price_str);
    let mut cash = hints
        .and_then(|h| h.cash_column.as_deref())
        .and_then(|name| header_index(headers, name))
        .and_then(|idx| field(fields, idx))
        .and_then(crate::normalizer::clean_price_str);

    for (idx, header) in headers.iter().enumerate() {
        if code_col_indices.contains(&idx) {
            continue;
        }
        let Some(value) = field(fields, idx) else {
            continue;
        };
        if gross.is_none() && is_gross_column(header) {
            if let Some(price) = crate::normalizer::clean_price_str(value) {
                gross = Some(price);
            }
        }
        if cash.is_none() && is_cash_column(header) {
            if let Some(price) = crate::normalizer::clean_price_str(value) {
                cash = Some(price);
            }
        }
    }
    (gross, cash)
}

fn is_gross_column(header: &str) -> bool {
    let has_gross_word = ["gross", "price", "charge", "amount"]
        .iter()
        .any(|w| header.contains(w));
    let excluded = ["cash", "discounted", "negotiated"]
        .iter()
        .any(|w| header.contains(w));
    has_gross_word && !excluded
}

fn is_cash_column(header: &str) -> bool {
    ["cash", "discounted", "self_pay"]
        .iter()
        .any(|w| header.contains(w))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_1_cms_csv_with_two_header_rows() {
        let csv_text = "hospital_name,Example Hospital\n\
                         last_updated_on,2024-01-01\n\
                         code|1,code|1|type,standard_charge|gross,standard_charge|discounted_cash\n\
                         99213,CPT,100,80\n\
                         99214,CPT,150,120\n";
        let rows = parse_table(csv_text, None).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].concept_code, "99213");
        assert_eq!(rows[0].gross, Some(100.0));
        assert_eq!(rows[0].cash, Some(80.0));
        assert_eq!(rows[1].concept_code, "99214");
        assert_eq!(rows[1].gross, Some(150.0));
        assert_eq!(rows[1].cash, Some(120.0));
    }

    #[test]
    fn vendor_mode_recognizes_hcpcs_column() {
        let csv_text = "hcpcs,gross_charge,cash_price\nJ1885,42.50,30.00\n";
        let rows = parse_table(csv_text, None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].vocabulary_id, "hcpcs");
        assert_eq!(rows[0].concept_code, "J1885");
        assert_eq!(rows[0].gross, Some(42.50));
        assert_eq!(rows[0].cash, Some(30.00));
    }

    #[test]
    fn minimal_mode_requires_five_digit_numeric_code() {
        let csv_text = "code,price\n99213,100\nnotacode,200\n";
        let rows = parse_table(csv_text, None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].concept_code, "99213");
    }

    #[test]
    fn gross_excludes_negotiated_columns() {
        let csv_text = "code,standard_charge_negotiated_gross,cash_price\n99213,999,50\n";
        let rows = parse_table(csv_text, None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].gross, None);
        assert_eq!(rows[0].cash, Some(50.0));
    }

    #[test]
    fn header_skip_hint_overrides_the_sniffing_heuristic() {
        let csv_text = "junk preamble row with no recognizable columns\ncode,price\n99213,100\n";
        let hints = ColumnHints { header_skip: Some(1), ..Default::default() };
        let rows = parse_table(csv_text, Some(&hints)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].concept_code, "99213");
    }

    #[test]
    fn code_column_hint_bypasses_the_five_digit_numeric_gate() {
        let csv_text = "procedure,price\nJ1885,42.50\n";
        let hints = ColumnHints { code_column: Some("procedure".to_string()), ..Default::default() };
        let rows = parse_table(csv_text, Some(&hints)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].concept_code, "J1885");
    }

    #[test]
    fn gross_and_cash_column_hints_override_name_heuristics() {
        let csv_text = "code,amount_a,amount_b\n99213,999,50\n";
        let hints = ColumnHints {
            gross_column: Some("amount_a".to_string()),
            cash_column: Some("amount_b".to_string()),
            ..Default::default()
        };
        let rows = parse_table(csv_text, Some(&hints)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].gross, Some(999.0));
        assert_eq!(rows[0].cash, Some(50.0));
    }

    #[test]
    fn detects_zip_magic_and_extracts_first_csv_member() {
        use std::io::Write;
        let mut buf = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            writer
                .start_file("prices.csv", zip::write::FileOptions::default())
                .unwrap();
            writer
                .write_all(b"code|1,code|1|type,standard_charge|gross,standard_charge|discounted_cash\n99213,CPT,100,80\n")
                .unwrap();
            writer.finish().unwrap();
        }
        let rows = extract_csv(&buf, None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].concept_code, "99213");
    }

    #[test]
    fn html_response_is_rejected() {
        let err = extract_csv(b"<!DOCTYPE html><html>nope</html>", None).unwrap_err();
        assert!(matches!(err, Error::HtmlInsteadOfData));
    }

    #[test]
    fn normalize_headers_collapses_whitespace_around_pipes() {
        let headers = normalize_headers("code | 1 | type,price", b',');
        assert_eq!(headers[0], "code|1|type");
    }
}
