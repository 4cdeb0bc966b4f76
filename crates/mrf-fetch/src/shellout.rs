//! System `unzip` fallback for archive members the in-process ZIP decoder cannot read (spec §4.2:
//! unsupported compression methods such as Deflate64). Bounded: a hard timeout and no stdout
//! capture beyond the extracted file itself.

use mrf_core::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

const UNZIP_TIMEOUT: Duration = Duration::from_secs(300);

pub fn which(bin: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let cand = dir.join(bin);
        if cand.is_file() {
            return Some(cand);
        }
    }
    None
}

/// Extracts `member_name` from the ZIP at `archive_path` into a fresh temp directory using the
/// host's `unzip` binary, returning the extracted file's path. The caller owns the returned
/// directory and is responsible for removing it.
pub fn extract_member_via_system_unzip(archive_path: &Path, member_name: &str) -> Result<PathBuf> {
    if which("unzip").is_none() {
        return Err(Error::UnsupportedCompression(
            "system unzip binary not found".to_string(),
        ));
    }

    let out_dir = tempfile::Builder::new()
        .prefix("mrf-unzip-")
        .tempdir()
        .map_err(|e| Error::Io(e.to_string()))?
        .into_path();

    let mut cmd = Command::new("unzip");
    cmd.arg("-o")
        .arg("-q")
        .arg(archive_path)
        .arg(member_name)
        .arg("-d")
        .arg(&out_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::UnsupportedCompression(format!("failed to spawn unzip: {e}")))?;

    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                if !status.success() {
                    let _ = std::fs::remove_dir_all(&out_dir);
                    return Err(Error::UnsupportedCompression(format!(
                        "unzip exited with {status}"
                    )));
                }
                break;
            }
            Ok(None) => {
                if start.elapsed() > UNZIP_TIMEOUT {
                    let _ = child.kill();
                    let _ = std::fs::remove_dir_all(&out_dir);
                    return Err(Error::UnsupportedCompression(
                        "system unzip timed out after 300s".to_string(),
                    ));
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                let _ = std::fs::remove_dir_all(&out_dir);
                return Err(Error::UnsupportedCompression(format!(
                    "failed to wait on unzip: {e}"
                )));
            }
        }
    }

    let extracted = out_dir.join(member_name);
    if !extracted.exists() {
        let _ = std::fs::remove_dir_all(&out_dir);
        return Err(Error::UnsupportedCompression(
            "unzip did not produce the requested member".to_string(),
        ));
    }
    Ok(extracted)
}
