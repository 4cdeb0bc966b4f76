//! Summary aggregator (spec §4.8): status-scan mode only (the file-scan alternative is not
//! implemented; see DESIGN.md open-question decisions). Consumes `status/<STATE>.csv` files and
//! produces `status/summary.csv` plus `status/badge.json`.

use crate::status::{read_state_csv, StatusRow};
use anyhow::{Context, Result};
use mrf_core::ScrapeStatus;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize)]
pub struct StateSummary {
    pub state: String,
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub success_rate: f64,
    pub records: usize,
    pub last_updated: String,
}

/// Scans every `status/<STATE>.csv` file under `status_dir` and aggregates one row per state.
pub fn build_summary(status_dir: &Path) -> Result<Vec<StateSummary>> {
    let mut summaries = Vec::new();
    let mut entries: Vec<_> = std::fs::read_dir(status_dir)
        .with_context(|| format!("reading {}", status_dir.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path().extension().and_then(|x| x.to_str()) == Some("csv")
                && e.path().file_stem().and_then(|s| s.to_str()) != Some("summary")
        })
        .collect();
    entries.sort_by_key(|e| e.path());

    for entry in entries {
        let path = entry.path();
        let state = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_uppercase();
        let rows = read_state_csv(&path)?;
        summaries.push(summarize_state(&state, &rows));
    }
    Ok(summaries)
}

fn summarize_state(state: &str, rows: &[StatusRow]) -> StateSummary {
    let mut summary = StateSummary {
        state: state.to_string(),
        ..Default::default()
    };
    let mut last_updated: Option<String> = None;

    for row in rows {
        summary.total += 1;
        summary.records += row.records;
        match row.status_enum() {
            Some(ScrapeStatus::Success) => summary.success += 1,
            Some(ScrapeStatus::Failure) => summary.failed += 1,
            Some(ScrapeStatus::Skipped) => summary.skipped += 1,
            None => {}
        }
        if last_updated.as_deref().map_or(true, |current| row.date.as_str() > current) {
            last_updated = Some(row.date.clone());
        }
    }

    summary.success_rate = if summary.total == 0 {
        0.0
    } else {
        (summary.success as f64 / summary.total as f64) * 100.0
    };
    summary.last_updated = last_updated.unwrap_or_default();
    summary
}

pub fn write_summary_csv(status_dir: &Path, summaries: &[StateSummary]) -> Result<()> {
    let path = status_dir.join("summary.csv");
    let mut writer = csv::Writer::from_path(&path).with_context(|| format!("writing {}", path.display()))?;
    for summary in summaries {
        writer.serialize(summary).context("serializing summary row")?;
    }
    writer.flush().context("flushing summary.csv")?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct Badge {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    label: String,
    message: String,
    color: String,
    #[serde(rename = "namedLogo")]
    named_logo: String,
    #[serde(rename = "cacheSeconds")]
    cache_seconds: u32,
}

fn badge_color(rate: f64) -> &'static str {
    if rate >= 90.0 {
        "brightgreen"
    } else if rate >= 75.0 {
        "green"
    } else if rate >= 50.0 {
        "yellow"
    } else {
        "red"
    }
}

/// Writes `status/badge.json` in shields.io endpoint-badge format, aggregating across every
/// state summary (spec §4.8).
pub fn write_badge_json(status_dir: &Path, summaries: &[StateSummary]) -> Result<()> {
    let total: usize = summaries.iter().map(|s| s.total).sum();
    let success: usize = summaries.iter().map(|s| s.success).sum();
    let rate = if total == 0 {
        0.0
    } else {
        (success as f64 / total as f64) * 100.0
    };

    let badge = Badge {
        schema_version: 1,
        label: "hospitals scraped".to_string(),
        message: format!("{success}/{total} ({:.0}%)", rate),
        color: badge_color(rate).to_string(),
        named_logo: "data".to_string(),
        cache_seconds: 3600,
    };

    let path = status_dir.join("badge.json");
    let body = serde_json::to_string_pretty(&badge).context("serializing badge.json")?;
    std::fs::write(&path, body).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Convenience used by the `summary` CLI subcommand: scans, writes both artifacts, returns the
/// per-state rows for any caller-side reporting.
pub fn regenerate(status_dir: &Path) -> Result<Vec<StateSummary>> {
    let summaries = build_summary(status_dir)?;
    write_summary_csv(status_dir, &summaries)?;
    write_badge_json(status_dir, &summaries)?;
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::write_state_csv;
    use chrono::Utc;
    use mrf_core::{HospitalRecord, ScrapeResult};

    fn record(ccn: &str) -> HospitalRecord {
        HospitalRecord {
            ccn: ccn.to_string(),
            hospital_name: "Test".to_string(),
            state: "TX".to_string(),
            file_url: "https://example.com/a.csv".to_string(),
            transparency_page: None,
            address: None,
            npi: None,
            idn: None,
            format_hint: None,
            extractor_override: None,
            column_hints: None,
        }
    }

    #[test]
    fn aggregates_success_failure_and_skipped_counts() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![
            StatusRow::from_result(&ScrapeResult::success(&record("1"), 10, 100), Utc::now()),
            StatusRow::from_result(
                &ScrapeResult::failure_named(&record("2"), "Timeout", "timed out", 200),
                Utc::now(),
            ),
            StatusRow::from_result(&ScrapeResult::skipped(&record("3"), "no extractor", 5), Utc::now()),
        ];
        write_state_csv(dir.path(), "tx", &rows).unwrap();

        let summaries = build_summary(dir.path()).unwrap();
        assert_eq!(summaries.len(), 1);
        let tx = &summaries[0];
        assert_eq!(tx.total, 3);
        assert_eq!(tx.success, 1);
        assert_eq!(tx.failed, 1);
        assert_eq!(tx.skipped, 1);
        assert_eq!(tx.records, 10);
    }

    #[test]
    fn badge_color_thresholds_match_spec() {
        assert_eq!(badge_color(95.0), "brightgreen");
        assert_eq!(badge_color(80.0), "green");
        assert_eq!(badge_color(60.0), "yellow");
        assert_eq!(badge_color(10.0), "red");
    }

    #[test]
    fn regenerate_writes_both_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![StatusRow::from_result(
            &ScrapeResult::success(&record("1"), 10, 100),
            Utc::now(),
        )];
        write_state_csv(dir.path(), "tx", &rows).unwrap();

        regenerate(dir.path()).unwrap();
        assert!(dir.path().join("summary.csv").exists());
        assert!(dir.path().join("badge.json").exists());

        let badge_body = std::fs::read_to_string(dir.path().join("badge.json")).unwrap();
        assert!(badge_body.contains("hospitals scraped"));
    }

    #[test]
    fn summary_csv_excludes_itself_on_rescans() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![StatusRow::from_result(
            &ScrapeResult::success(&record("1"), 10, 100),
            Utc::now(),
        )];
        write_state_csv(dir.path(), "tx", &rows).unwrap();
        regenerate(dir.path()).unwrap();

        let summaries = build_summary(dir.path()).unwrap();
        assert_eq!(summaries.len(), 1);
    }
}
