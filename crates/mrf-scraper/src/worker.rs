//! Single-hospital worker pipeline (spec §4.6): runs inside the hidden `worker` subcommand, one
//! hospital per process. Reads a `WorkerInput` as one JSON line on stdin, writes a `ScrapeResult`
//! as the last line on stdout, and exits. Never panics out of the process: any error is converted
//! into a failure `ScrapeResult` before returning.

use mrf_core::{Fetcher, HospitalRecord, PriceRecord, ScrapeResult};
use mrf_fetch::{HttpFetcher, VocabularyIndex};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInput {
    pub record: HospitalRecord,
    pub data_dir: PathBuf,
    pub vocab_path: PathBuf,
    pub max_age_days: u32,
    pub dry_run: bool,
}

/// Reads one `WorkerInput` JSON line from stdin, runs the pipeline, and writes the resulting
/// `ScrapeResult` as the last stdout line. The orchestrator parent never parses anything else the
/// child might print to stdout (workers must send diagnostics to stderr).
pub async fn run_worker_from_stdin() -> anyhow::Result<()> {
    let mut input_line = String::new();
    std::io::Read::read_to_string(&mut std::io::stdin(), &mut input_line)?;
    let input: WorkerInput = serde_json::from_str(input_line.trim())?;

    let result = scrape_one(&input).await;
    let line = serde_json::to_string(&result)?;
    println!("{line}");
    std::io::stdout().flush()?;
    Ok(())
}

/// Checks whether a prior output for this hospital exists and is newer than `max_age_days`
/// (spec §4.6 incremental skip, checked inside the child before fetching).
fn existing_output_is_fresh(path: &Path, max_age_days: u32) -> bool {
    if max_age_days == 0 {
        return false;
    }
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    let Ok(modified) = metadata.modified() else {
        return false;
    };
    let age = match modified.elapsed() {
        Ok(age) => age,
        Err(_) => return false,
    };
    age.as_secs() < u64::from(max_age_days) * 86_400
}

pub async fn scrape_one(input: &WorkerInput) -> ScrapeResult {
    let start = Instant::now();
    let record = &input.record;
    let output_path = input.data_dir.join(&record.state).join(format!("{}.jsonl", record.ccn));

    if existing_output_is_fresh(&output_path, input.max_age_days) {
        return ScrapeResult::skipped(
            record,
            &format!("data is less than {} days old", input.max_age_days),
            elapsed_ms(start),
        );
    }

    let Some(extractor) = mrf_fetch::select_extractor(record) else {
        return ScrapeResult::skipped(record, "no extractor", elapsed_ms(start));
    };

    let vocabulary = match VocabularyIndex::load(&input.vocab_path) {
        Ok(v) => v,
        Err(e) => return ScrapeResult::failure(record, &e, elapsed_ms(start)),
    };

    let fetcher = match HttpFetcher::new() {
        Ok(f) => f,
        Err(e) => return ScrapeResult::failure(record, &e, elapsed_ms(start)),
    };

    let intermediate = match fetch_and_extract(&fetcher, record, extractor).await {
        Ok(rows) => rows,
        Err(e) => return ScrapeResult::failure(record, &e, elapsed_ms(start)),
    };

    let price_records = mrf_fetch::normalize(&intermediate, &vocabulary);
    if price_records.is_empty() {
        return ScrapeResult::failure(record, &mrf_core::Error::NoCharges, elapsed_ms(start));
    }

    if input.dry_run {
        return ScrapeResult::success(record, price_records.len(), elapsed_ms(start));
    }

    if let Err(e) = write_jsonl(&output_path, &price_records) {
        return ScrapeResult::failure(record, &e, elapsed_ms(start));
    }

    ScrapeResult::success(record, price_records.len(), elapsed_ms(start))
}

fn extract(
    extractor: mrf_core::ExtractorKind,
    bytes: &[u8],
    hints: Option<&mrf_core::ColumnHints>,
) -> mrf_core::Result<Vec<mrf_core::IntermediateRow>> {
    use mrf_core::ExtractorKind;
    match extractor {
        ExtractorKind::Json => mrf_fetch::extractors::extract_json(bytes),
        ExtractorKind::Csv => mrf_fetch::extractors::extract_csv(bytes, hints),
        ExtractorKind::Xlsx => mrf_fetch::extractors::extract_xlsx(bytes, hints),
        ExtractorKind::Zip => mrf_fetch::extractors::extract_zip(bytes, hints),
    }
}

/// Probes content length before fetching; CSV files above the streaming threshold are streamed to
/// a temp file and parsed in fixed-size row chunks rather than held in memory whole (spec §4.1's
/// large-file path). Every other format, and CSV below the threshold, is fetched into memory.
async fn fetch_and_extract(
    fetcher: &HttpFetcher,
    record: &HospitalRecord,
    extractor: mrf_core::ExtractorKind,
) -> mrf_core::Result<Vec<mrf_core::IntermediateRow>> {
    if extractor == mrf_core::ExtractorKind::Csv {
        let content_length = fetcher.probe_content_length(&record.file_url).await?;
        if content_length.unwrap_or(0) > mrf_core::STREAMING_THRESHOLD_BYTES {
            let path = fetcher.fetch_to_tempfile(&record.file_url).await?;
            let result = mrf_fetch::extractors::csv_extractor::extract_csv_from_file_chunked(
                &path,
                record.column_hints.as_ref(),
            );
            let _ = std::fs::remove_file(&path);
            return result;
        }
    }

    let bytes = fetcher.fetch(&record.file_url).await?;
    extract(extractor, &bytes, record.column_hints.as_ref())
}

fn write_jsonl(path: &Path, records: &[PriceRecord]) -> mrf_core::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| mrf_core::Error::Io(e.to_string()))?;
    }
    let mut file = std::fs::File::create(path).map_err(|e| mrf_core::Error::Io(e.to_string()))?;
    for record in records {
        let line = serde_json::to_string(record).map_err(|e| mrf_core::Error::JsonDecodeError(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| mrf_core::Error::Io(e.to_string()))?;
    }
    Ok(())
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
