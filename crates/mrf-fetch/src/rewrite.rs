//! Google Drive URL rewriting (spec §4.1). Drive share links serve an HTML virus-scan warning
//! page for files above its scan-skip size; this module rewrites the share link to the direct
//! download form up front, then detects and resolves the virus-scan page if the server still
//! serves it.

use mrf_core::{Error, Result};
use regex::Regex;
use std::sync::OnceLock;

fn drive_file_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"drive\.google\.com/file/d/([a-zA-Z0-9_-]+)").unwrap())
}

fn drive_confirm_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"confirm=([0-9A-Za-z_-]+)"#).unwrap())
}

fn drive_uuid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"name="uuid"\s+value="([0-9a-fA-F-]+)""#).unwrap()
    })
}

/// Rewrites a Google Drive `/file/d/{id}/view` URL to the direct-download form. All other URLs
/// pass through unchanged.
pub fn rewrite_url(url: &str) -> String {
    if let Some(caps) = drive_file_id_re().captures(url) {
        let id = &caps[1];
        format!("https://drive.google.com/uc?export=download&id={id}&confirm=t")
    } else {
        url.to_string()
    }
}

/// If `resp` is actually Google Drive's HTML virus-scan warning page, parse the confirm UUID and
/// re-fetch the real download URL. Otherwise return `resp` unchanged.
pub async fn resolve_drive_virus_scan(
    client: &reqwest::Client,
    resp: reqwest::Response,
) -> Result<reqwest::Response> {
    let is_drive = resp
        .url()
        .host_str()
        .map(|h| h.contains("drive.google.com") || h.contains("drive.usercontent.google.com"))
        .unwrap_or(false);
    let content_type_is_html = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("text/html"))
        .unwrap_or(false);

    if !is_drive || !content_type_is_html {
        return Ok(resp);
    }

    let original_url = resp.url().clone();
    let body = resp
        .text()
        .await
        .map_err(|e| Error::ConnectionError(e.to_string()))?;
    if !body.contains("Google Drive - Virus scan warning") && !body.contains("uuid") {
        // Not actually the scan page (small public files skip it); caller gets an HTML error
        // from the normal detection path instead of a silent pass-through.
        return rebuild_response_error(body);
    }

    let uuid = drive_uuid_re()
        .captures(&body)
        .or_else(|| drive_confirm_token_re().captures(&body))
        .map(|c| c[1].to_string());

    let Some(uuid) = uuid else {
        return rebuild_response_error(body);
    };

    let mut retry_url = original_url.clone();
    retry_url
        .query_pairs_mut()
        .append_pair("confirm", "t")
        .append_pair("uuid", &uuid);

    client
        .get(retry_url)
        .send()
        .await
        .map_err(|e| Error::ConnectionError(e.to_string()))
}

fn rebuild_response_error(body: String) -> Result<reqwest::Response> {
    if crate::archive::looks_like_html(body.as_bytes()) {
        Err(Error::HtmlInsteadOfData)
    } else {
        Err(Error::ConnectionError(
            "drive response could not be resolved".to_string(),
        ))
    }
}
