//! Orchestrator (spec §4.6, §5): supervises one OS subprocess per hospital via a bounded worker
//! pool, enforcing a hard per-hospital timeout with a terminate-then-kill escalation. The child is
//! this same binary re-exec'd with the hidden `worker` subcommand; the hospital record and run
//! configuration cross the process boundary as one JSON line on the child's stdin, and its result
//! comes back as one JSON line on the child's stdout.

use crate::status::StatusRow;
use crate::worker::WorkerInput;
use anyhow::{Context, Result};
use chrono::Utc;
use mrf_core::{HospitalRecord, ScrapeResult};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;

const TERM_GRACE: Duration = Duration::from_secs(5);
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub parallel: usize,
    pub timeout: Duration,
    pub max_age_days: u32,
    pub dry_run: bool,
    pub data_dir: PathBuf,
    pub status_dir: PathBuf,
    pub vocab_path: PathBuf,
}

pub struct RunOutcome {
    pub results: Vec<ScrapeResult>,
    pub any_failure: bool,
}

/// Runs the full fleet (or the filtered slice the caller already narrowed via the catalog loader)
/// and writes per-state status CSVs unless `dry_run` is set (spec §4.6).
pub async fn run(records: Vec<HospitalRecord>, config: &OrchestratorConfig) -> Result<RunOutcome> {
    let semaphore = Arc::new(Semaphore::new(config.parallel.max(1)));
    let worker_exe = std::env::current_exe().context("resolving current executable path for worker re-exec")?;

    let mut handles = Vec::with_capacity(records.len());
    for record in records {
        let semaphore = Arc::clone(&semaphore);
        let worker_exe = worker_exe.clone();
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
            run_one_with_timeout(&worker_exe, record, &config).await
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.await.context("worker task panicked")?);
    }

    let any_failure = results.iter().any(|r| r.status == mrf_core::ScrapeStatus::Failure);

    if !config.dry_run {
        write_status_by_state(&config.status_dir, &results)?;
    }

    Ok(RunOutcome { results, any_failure })
}

async fn run_one_with_timeout(
    worker_exe: &std::path::Path,
    record: HospitalRecord,
    config: &OrchestratorConfig,
) -> ScrapeResult {
    let start = std::time::Instant::now();
    let input = WorkerInput {
        record: record.clone(),
        data_dir: config.data_dir.clone(),
        vocab_path: config.vocab_path.clone(),
        max_age_days: config.max_age_days,
        dry_run: config.dry_run,
    };

    let (mut child, mut stdout) = match spawn_worker(worker_exe, &input).await {
        Ok(pair) => pair,
        Err(e) => {
            return ScrapeResult::failure_named(
                &record,
                "WorkerCrashed",
                &e.to_string(),
                start.elapsed().as_millis() as u64,
            )
        }
    };

    // `child.wait()` only borrows the child (unlike `wait_with_output`, which consumes it), so
    // the timeout branch below can still reach for it to escalate.
    match tokio::time::timeout(config.timeout, child.wait()).await {
        Ok(Ok(status)) => {
            let mut buf = Vec::new();
            let _ = tokio::io::AsyncReadExt::read_to_end(&mut stdout, &mut buf).await;
            parse_worker_output(&record, status, &buf, start)
        }
        Ok(Err(e)) => ScrapeResult::failure_named(
            &record,
            "WorkerCrashed",
            &e.to_string(),
            start.elapsed().as_millis() as u64,
        ),
        Err(_) => {
            // The timeout future drops here, but dropping a `tokio::process::Child` does not by
            // itself send any signal; the worker must be walked through the terminate-then-kill
            // escalation explicitly or it (and any temp files it holds open) would outlive the
            // run (spec §5, §8).
            escalate_if_alive(&mut child).await;
            ScrapeResult::failure_named(
                &record,
                "TimeoutError",
                &format!("worker exceeded {}s hard timeout", config.timeout.as_secs()),
                start.elapsed().as_millis() as u64,
            )
        }
    }
}

async fn spawn_worker(
    worker_exe: &std::path::Path,
    input: &WorkerInput,
) -> Result<(tokio::process::Child, tokio::process::ChildStdout)> {
    let mut child = Command::new(worker_exe)
        .arg("worker")
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::inherit())
        // Backstop: if this process itself is killed before the escalation logic runs, the
        // kernel still reaps the child rather than leaving it orphaned.
        .kill_on_drop(true)
        .spawn()
        .context("spawning worker subprocess")?;

    let payload = serde_json::to_vec(input).context("serializing worker input")?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(&payload).await.context("writing worker stdin")?;
        stdin.write_all(b"\n").await.context("writing worker stdin newline")?;
        drop(stdin);
    }
    let stdout = child.stdout.take().expect("stdout piped at spawn");
    Ok((child, stdout))
}

fn parse_worker_output(
    record: &HospitalRecord,
    status: std::process::ExitStatus,
    stdout_bytes: &[u8],
    start: std::time::Instant,
) -> ScrapeResult {
    let stdout = String::from_utf8_lossy(stdout_bytes);
    let last_line = stdout.lines().rev().find(|l| !l.trim().is_empty());

    match last_line.and_then(|l| serde_json::from_str::<ScrapeResult>(l).ok()) {
        Some(result) => result,
        None => ScrapeResult::failure_named(
            record,
            "WorkerCrashed",
            &format!("worker exited with status {status:?} and produced no parseable result line"),
            start.elapsed().as_millis() as u64,
        ),
    }
}

/// Terminate-then-kill escalation for a child that may still be alive (spec §5: SIGTERM with
/// 5-second grace, then SIGKILL with 2-second grace). A no-op if the child has already exited.
async fn escalate_if_alive(child: &mut tokio::process::Child) {
    if child.try_wait().ok().flatten().is_some() {
        return;
    }
    send_sigterm(child);
    if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok() {
        return;
    }
    let _ = child.start_kill();
    let _ = tokio::time::timeout(KILL_GRACE, child.wait()).await;
}

#[cfg(unix)]
fn send_sigterm(child: &tokio::process::Child) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut tokio::process::Child) {
    let _ = child.start_kill();
}

fn write_status_by_state(status_dir: &std::path::Path, results: &[ScrapeResult]) -> Result<()> {
    let now = Utc::now();
    let mut by_state: BTreeMap<String, Vec<StatusRow>> = BTreeMap::new();
    for result in results {
        by_state
            .entry(result.state.clone())
            .or_default()
            .push(StatusRow::from_result(result, now));
    }
    for (state, rows) in by_state {
        crate::status::write_state_csv(status_dir, &state, &rows)
            .with_context(|| format!("writing status for state {state}"))?;
    }
    Ok(())
}
