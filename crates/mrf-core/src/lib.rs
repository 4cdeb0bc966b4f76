use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Error kinds observable externally via `error_type` on a scrape result (spec §7).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    // -- transport --
    #[error("timeout")]
    Timeout,
    #[error("connection error: {0}")]
    ConnectionError(String),
    #[error("retryable http error: {0}")]
    RetryableHttpError(String),
    #[error("permanent http error: {status} for {url}")]
    PermanentHttpError { status: u16, url: String },

    // -- content --
    #[error("server returned HTML instead of data")]
    HtmlInsteadOfData,
    #[error("bad zip file: {0}")]
    BadZipFile(String),
    #[error("unsupported compression: {0}")]
    UnsupportedCompression(String),
    #[error("decode error: {0}")]
    DecodeError(String),
    #[error("json decode error: {0}")]
    JsonDecodeError(String),
    #[error("parser error: {0}")]
    ParserError(String),

    // -- semantic --
    #[error("no charges extracted")]
    NoCharges,
    #[error("no extractor matched")]
    NoExtractor,

    // -- lifecycle --
    #[error("worker timed out")]
    TimeoutError,
    #[error("worker crashed: {0}")]
    WorkerCrashed(String),

    // -- boundary --
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("io error: {0}")]
    Io(String),
}

impl Error {
    /// The `error_type` string surfaced in status rows and JSON output (spec §7).
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::Timeout => "Timeout",
            Error::ConnectionError(_) => "ConnectionError",
            Error::RetryableHttpError(_) => "RetryableHttpError",
            Error::PermanentHttpError { .. } => "PermanentHttpError",
            Error::HtmlInsteadOfData => "HtmlInsteadOfData",
            Error::BadZipFile(_) => "BadZipFile",
            Error::UnsupportedCompression(_) => "UnsupportedCompression",
            Error::DecodeError(_) => "DecodeError",
            Error::JsonDecodeError(_) => "JsonDecodeError",
            Error::ParserError(_) => "ParserError",
            Error::NoCharges => "NoCharges",
            Error::NoExtractor => "NoExtractor",
            Error::TimeoutError => "TimeoutError",
            Error::WorkerCrashed(_) => "WorkerCrashed",
            Error::InvalidUrl(_) => "InvalidUrl",
            Error::Io(_) => "IoError",
        }
    }

    /// Whether the fetcher may retry a request that failed with this error (spec §4.1, §7).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout | Error::ConnectionError(_) | Error::RetryableHttpError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Procedure-code vocabulary a price record belongs to (spec §3, GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vocabulary {
    Cpt,
    Hcpcs,
}

impl Vocabulary {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "cpt" | "cpt4" => Some(Vocabulary::Cpt),
            "hcpcs" => Some(Vocabulary::Hcpcs),
            _ => None,
        }
    }
}

/// Which of the two tracked prices a record carries (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum PriceKind {
    Gross,
    Cash,
}

/// Explicit extractor selection, either from a hospital record override or the registry (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorKind {
    Json,
    Csv,
    Xlsx,
    Zip,
}

impl ExtractorKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "json" => Some(ExtractorKind::Json),
            "csv" => Some(ExtractorKind::Csv),
            "xlsx" | "xls" => Some(ExtractorKind::Xlsx),
            "zip" => Some(ExtractorKind::Zip),
            _ => None,
        }
    }
}

/// Per-file column-mapping hints a catalog row may carry (spec §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnHints {
    pub code_column: Option<String>,
    pub gross_column: Option<String>,
    pub cash_column: Option<String>,
    pub header_skip: Option<usize>,
}

/// A single hospital entry read from the catalog (spec §3, §4.7). Read-only to the core once
/// loaded; the core never mutates a record during a scrape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HospitalRecord {
    pub ccn: String,
    pub hospital_name: String,
    pub state: String,
    pub file_url: String,
    pub transparency_page: Option<String>,
    pub address: Option<String>,
    pub npi: Option<String>,
    pub idn: Option<String>,
    pub format_hint: Option<String>,
    pub extractor_override: Option<ExtractorKind>,
    pub column_hints: Option<ColumnHints>,
}

impl HospitalRecord {
    /// The two-letter state code encoded in the first two characters of the CCN (GLOSSARY).
    pub fn state_from_ccn(&self) -> Option<&str> {
        self.ccn.get(0..2)
    }
}

/// Final disposition of a single hospital's scrape attempt (spec §3, §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScrapeStatus {
    Success,
    Failure,
    Skipped,
}

/// Result of attempting to scrape one hospital, produced by a worker and flushed once per run
/// to the per-state status table (spec §3, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeResult {
    pub ccn: String,
    pub hospital_name: String,
    pub state: String,
    pub file_url: String,
    pub status: ScrapeStatus,
    pub records: usize,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub reason: Option<String>,
    pub duration_ms: u64,
}

const ERROR_MESSAGE_MAX_LEN: usize = 500;

fn truncate_message(message: &str) -> String {
    if message.len() <= ERROR_MESSAGE_MAX_LEN {
        message.to_string()
    } else {
        message.chars().take(ERROR_MESSAGE_MAX_LEN).collect()
    }
}

impl ScrapeResult {
    pub fn success(record: &HospitalRecord, records: usize, duration_ms: u64) -> Self {
        Self {
            ccn: record.ccn.clone(),
            hospital_name: record.hospital_name.clone(),
            state: record.state.clone(),
            file_url: record.file_url.clone(),
            status: ScrapeStatus::Success,
            records,
            error_type: None,
            error_message: None,
            reason: None,
            duration_ms,
        }
    }

    pub fn failure(record: &HospitalRecord, err: &Error, duration_ms: u64) -> Self {
        Self {
            ccn: record.ccn.clone(),
            hospital_name: record.hospital_name.clone(),
            state: record.state.clone(),
            file_url: record.file_url.clone(),
            status: ScrapeStatus::Failure,
            records: 0,
            error_type: Some(err.kind_name().to_string()),
            error_message: Some(truncate_message(&err.to_string())),
            reason: None,
            duration_ms,
        }
    }

    pub fn failure_named(
        record: &HospitalRecord,
        error_type: &str,
        message: &str,
        duration_ms: u64,
    ) -> Self {
        Self {
            ccn: record.ccn.clone(),
            hospital_name: record.hospital_name.clone(),
            state: record.state.clone(),
            file_url: record.file_url.clone(),
            status: ScrapeStatus::Failure,
            records: 0,
            error_type: Some(error_type.to_string()),
            error_message: Some(truncate_message(message)),
            reason: None,
            duration_ms,
        }
    }

    pub fn skipped(record: &HospitalRecord, reason: &str, duration_ms: u64) -> Self {
        Self {
            ccn: record.ccn.clone(),
            hospital_name: record.hospital_name.clone(),
            state: record.state.clone(),
            file_url: record.file_url.clone(),
            status: ScrapeStatus::Skipped,
            records: 0,
            error_type: None,
            error_message: None,
            reason: Some(reason.to_string()),
            duration_ms,
        }
    }
}

/// A single `(code, kind, price)` output triple (spec §3, §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    #[serde(rename = "cpt")]
    pub code: String,
    #[serde(rename = "type")]
    pub kind: PriceKind,
    pub price: f64,
}

/// The uniform four-column table every format extractor produces (spec §4.3). Extractors never
/// filter by vocabulary or de-duplicate — that is the normalizer's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntermediateRow {
    pub vocabulary_id: String,
    pub concept_code: String,
    pub gross: Option<f64>,
    pub cash: Option<f64>,
}

/// Outcome of a HEAD/accessibility probe (spec §4.1 `check_url`).
#[derive(Debug, Clone)]
pub struct UrlCheck {
    pub accessible: bool,
    pub reason: String,
}

/// The HTTP fetcher's contract (spec §4.1). Implemented by `mrf-fetch`'s reqwest-backed client;
/// kept as a trait so extractors and tests can substitute a fake.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch the full response body, following retries and URL rewrites.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;

    /// Fetch and decode a JSON body, tolerating a leading BOM and detecting an HTML response.
    async fn fetch_json(&self, url: &str) -> Result<serde_json::Value>;

    /// Stream the response to a temp file when its content length is above the streaming
    /// threshold; returns the path. The caller owns the returned file and must delete it.
    async fn fetch_to_tempfile(&self, url: &str) -> Result<PathBuf>;

    /// Probe the content length via HEAD, falling back to a streamed GET if HEAD is rejected.
    async fn probe_content_length(&self, url: &str) -> Result<Option<u64>>;

    /// Lightweight reachability check used by `--validate-only`.
    async fn check_url(&self, url: &str) -> UrlCheck;
}

/// Size above which the fetcher streams to a temp file instead of buffering in memory (spec §4.1).
pub const STREAMING_THRESHOLD_BYTES: u64 = 100 * 1024 * 1024;

/// Regex pattern every output `code` must match (spec §3, §8).
pub const CODE_PATTERN: &str = r"^[0-9A-Z]{5}$";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocabulary_parse_is_case_insensitive_and_folds_cpt4() {
        assert_eq!(Vocabulary::parse("CPT"), Some(Vocabulary::Cpt));
        assert_eq!(Vocabulary::parse("cpt4"), Some(Vocabulary::Cpt));
        assert_eq!(Vocabulary::parse("HCPCS"), Some(Vocabulary::Hcpcs));
        assert_eq!(Vocabulary::parse("icd10"), None);
    }

    #[test]
    fn error_message_is_truncated_to_500_chars() {
        let record = HospitalRecord {
            ccn: "470011".into(),
            hospital_name: "Test".into(),
            state: "AZ".into(),
            file_url: "https://example.com/x.csv".into(),
            transparency_page: None,
            address: None,
            npi: None,
            idn: None,
            format_hint: None,
            extractor_override: None,
            column_hints: None,
        };
        let long = "x".repeat(900);
        let result = ScrapeResult::failure_named(&record, "ParserError", &long, 10);
        assert_eq!(result.error_message.unwrap().len(), 500);
    }

    #[test]
    fn state_from_ccn_reads_first_two_chars() {
        let record = HospitalRecord {
            ccn: "470011".into(),
            hospital_name: "Test".into(),
            state: "AZ".into(),
            file_url: "https://example.com/x.csv".into(),
            transparency_page: None,
            address: None,
            npi: None,
            idn: None,
            format_hint: None,
            extractor_override: None,
            column_hints: None,
        };
        assert_eq!(record.state_from_ccn(), Some("47"));
    }

    #[test]
    fn price_record_serializes_type_field_name() {
        let row = PriceRecord {
            code: "99213".into(),
            kind: PriceKind::Gross,
            price: 100.0,
        };
        let json = serde_json::to_string(&row).unwrap();
        assert!(json.contains("\"type\":\"gross\""));
        assert!(json.contains("\"cpt\":\"99213\""));
    }

    #[test]
    fn retryable_errors_are_classified_per_spec() {
        assert!(Error::Timeout.is_retryable());
        assert!(Error::ConnectionError("reset".into()).is_retryable());
        assert!(!Error::PermanentHttpError {
            status: 404,
            url: "x".into()
        }
        .is_retryable());
        assert!(!Error::HtmlInsteadOfData.is_retryable());
    }
}
