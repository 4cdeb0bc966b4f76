//! Archive and decoder helpers (spec §4.2): encoding fallback, delimiter detection, ZIP/OOXML
//! probing, and HTML detection.

use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use mrf_core::{Error, Result};

const ZIP_LOCAL_FILE_MAGIC: &[u8] = b"PK\x03\x04";
const ZIP_EMPTY_ARCHIVE_MAGIC: &[u8] = b"PK\x05\x06";

/// Decode order per spec §4.2: utf-8, cp1252, latin-1, iso-8859-1. latin-1 and iso-8859-1 decode
/// identically for any byte sequence (both map every byte 1:1 to the matching code point), so
/// cp1252 is the only meaningfully different fallback before the final lossy pass.
pub fn decode_with_fallback(bytes: &[u8]) -> String {
    if let Ok(s) = std::str::from_utf8(bytes) {
        return s.to_string();
    }
    let (decoded, _, had_errors) = WINDOWS_1252.decode(bytes);
    if !had_errors {
        return decoded.into_owned();
    }
    latin1_decode(bytes)
}

fn latin1_decode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Final, always-succeeding decode used only after `decode_with_fallback`'s preferred codecs have
/// all rejected the input; replaces invalid sequences rather than failing.
pub fn decode_lossy(bytes: &[u8]) -> String {
    let (decoded, _, _) = UTF_8.decode(bytes);
    decoded.into_owned()
}

const CANDIDATE_DELIMITERS: [u8; 4] = [b',', b'|', b'\t', b';'];

/// Sample the first ~10 lines and pick the delimiter whose occurrence count is most stable
/// (lowest variance) across sampled rows; default to `,` on a tie (spec §4.2).
pub fn detect_delimiter(text: &str) -> u8 {
    let lines: Vec<&str> = text.lines().take(10).filter(|l| !l.is_empty()).collect();
    if lines.is_empty() {
        return b',';
    }

    let mut best_delim = b',';
    let mut best_score: Option<(i64, i64)> = None; // (variance, -mean) tuple, lower is better

    for &delim in &CANDIDATE_DELIMITERS {
        let counts: Vec<i64> = lines
            .iter()
            .map(|l| l.bytes().filter(|&b| b == delim).count() as i64)
            .collect();
        let mean_occurrences: i64 = counts.iter().sum::<i64>() / counts.len() as i64;
        if mean_occurrences == 0 {
            continue;
        }
        let variance: i64 = counts
            .iter()
            .map(|c| (c - mean_occurrences).pow(2))
            .sum::<i64>()
            / counts.len() as i64;
        let score = (variance, -mean_occurrences);
        if best_score.is_none() || score < best_score.unwrap() {
            best_score = Some(score);
            best_delim = delim;
        }
    }
    best_delim
}

/// A buffer is a ZIP iff it parses as one, or begins with the local-file-header magic (spec §4.2).
pub fn is_zip(bytes: &[u8]) -> bool {
    if bytes.starts_with(ZIP_LOCAL_FILE_MAGIC) || bytes.starts_with(ZIP_EMPTY_ARCHIVE_MAGIC) {
        return true;
    }
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).is_ok()
}

const OOXML_MARKERS: [&str; 3] = ["[Content_Types].xml", "_rels/.rels", "xl/workbook.xml"];

/// An open ZIP is an Office Open XML workbook iff it contains any OOXML marker entry (spec §4.2).
pub fn is_ooxml(archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>) -> bool {
    for i in 0..archive.len() {
        if let Ok(entry) = archive.by_index(i) {
            if OOXML_MARKERS.contains(&entry.name()) {
                return true;
            }
        }
    }
    false
}

/// First line of the body checked against the two doctype markers (spec §4.2).
pub fn looks_like_html(bytes: &[u8]) -> bool {
    let sample = &bytes[..bytes.len().min(512)];
    let text = decode_lossy(sample).to_ascii_lowercase();
    let first_line = text.lines().next().unwrap_or("").trim();
    first_line.starts_with("<!doctype html") || first_line.starts_with("<html")
}

/// Member kind found inside a ZIP, used by the ZIP-wrapping extractor to pick a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Csv,
    Json,
}

/// Picks the preferred member from a ZIP's file list: a CSV member wins over a JSON member when
/// both exist (spec §4.2).
pub fn pick_member<'a>(names: &[&'a str]) -> Option<(&'a str, MemberKind)> {
    let csv = names
        .iter()
        .find(|n| n.to_ascii_lowercase().ends_with(".csv"));
    if let Some(n) = csv {
        return Some((n, MemberKind::Csv));
    }
    names
        .iter()
        .find(|n| n.to_ascii_lowercase().ends_with(".json"))
        .map(|n| (*n, MemberKind::Json))
}

/// Extract a named member's bytes from an in-memory ZIP, translating unreadable-compression
/// errors into the typed `UnsupportedCompression` variant so the caller can fall back to the
/// system `unzip` (spec §4.2).
pub fn extract_member(bytes: &[u8], member_name: &str) -> Result<Vec<u8>> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| Error::BadZipFile(e.to_string()))?;
    let mut file = archive.by_name(member_name).map_err(|e| match e {
        zip::result::ZipError::UnsupportedArchive(msg) => {
            Error::UnsupportedCompression(msg.to_string())
        }
        other => Error::BadZipFile(other.to_string()),
    })?;
    let mut out = Vec::new();
    use std::io::Read;
    file.read_to_end(&mut out)
        .map_err(|e| Error::UnsupportedCompression(e.to_string()))?;
    Ok(out)
}

pub fn member_names(bytes: &[u8]) -> Result<Vec<String>> {
    let archive =
        zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| Error::BadZipFile(e.to_string()))?;
    Ok(archive.file_names().map(|s| s.to_string()).collect())
}
