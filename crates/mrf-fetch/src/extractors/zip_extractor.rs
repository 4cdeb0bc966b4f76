//! ZIP extractor (spec §4.3.4): classifies the fetched bytes, unwraps a ZIP if present, and
//! dispatches the inner payload to the matching format extractor.

use crate::{archive, shellout};
use mrf_core::{ColumnHints, Error, IntermediateRow, Result};

/// Accepts raw, possibly-ZIP-wrapped bytes and produces the uniform intermediate rows. Not every
/// file whose URL ends in `.zip` is actually a ZIP (spec §8 scenario 4: CSV served with a ZIP
/// content type) and not every ZIP wraps a CSV or JSON payload (it may be an XLSX workbook).
pub fn extract_zip(bytes: &[u8], hints: Option<&ColumnHints>) -> Result<Vec<IntermediateRow>> {
    if !archive::is_zip(bytes) {
        return dispatch_non_zip(bytes, hints);
    }

    let names = archive::member_names(bytes)?;
    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();

    {
        let mut archive_handle = zip::ZipArchive::new(std::io::Cursor::new(bytes))
            .map_err(|e| Error::BadZipFile(e.to_string()))?;
        if archive::is_ooxml(&mut archive_handle) {
            return super::xlsx_extractor::extract_xlsx(bytes, hints);
        }
    }

    let Some((member_name, kind)) = archive::pick_member(&name_refs) else {
        return Err(Error::ParserError(
            "zip archive contains no csv or json member".to_string(),
        ));
    };

    let member_bytes = match archive::extract_member(bytes, member_name) {
        Ok(b) => b,
        Err(Error::UnsupportedCompression(_)) => extract_via_system_unzip(bytes, member_name)?,
        Err(e) => return Err(e),
    };

    match kind {
        archive::MemberKind::Csv => super::csv_extractor::extract_csv(&member_bytes, hints),
        archive::MemberKind::Json => super::json_extractor::extract_json(&member_bytes),
    }
}

fn extract_via_system_unzip(bytes: &[u8], member_name: &str) -> Result<Vec<u8>> {
    let tmp = tempfile::Builder::new()
        .prefix("mrf-zip-src-")
        .suffix(".zip")
        .tempfile()
        .map_err(|e| Error::Io(e.to_string()))?;
    std::fs::write(tmp.path(), bytes).map_err(|e| Error::Io(e.to_string()))?;

    let extracted_path = shellout::extract_member_via_system_unzip(tmp.path(), member_name)?;
    let data = std::fs::read(&extracted_path).map_err(|e| Error::Io(e.to_string()))?;
    if let Some(parent) = extracted_path.parent() {
        let _ = std::fs::remove_dir_all(parent);
    }
    Ok(data)
}

/// A `.zip`-named response that isn't actually a ZIP: inspect the leading bytes and hand off to
/// JSON or CSV directly (spec §8 scenario 4).
fn dispatch_non_zip(bytes: &[u8], hints: Option<&ColumnHints>) -> Result<Vec<IntermediateRow>> {
    if archive::looks_like_html(bytes) {
        return Err(Error::HtmlInsteadOfData);
    }
    let sample: &[u8] = &bytes[..bytes.len().min(64)];
    let first_non_ws = sample.iter().find(|b| !b.is_ascii_whitespace());
    match first_non_ws {
        Some(b'{') | Some(b'[') => super::json_extractor::extract_json(bytes),
        _ => super::csv_extractor::extract_csv(bytes, hints),
    }
}
