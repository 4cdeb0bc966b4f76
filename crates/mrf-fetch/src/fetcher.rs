//! Resilient HTTP fetcher (spec §4.1): retries with backoff and jitter, a TLS configuration that
//! tolerates legacy servers, header-profile selection, URL rewrites, and streaming-to-tempfile
//! above a size threshold.

use mrf_core::{Error, Fetcher, Result, UrlCheck, STREAMING_THRESHOLD_BYTES};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/124.0.0.0 Safari/537.36";
const CURL_LIKE_USER_AGENT: &str = "curl/8.4.0";
const MAX_RETRIES: u32 = 3;
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Domains known to reject browser-looking headers; a minimal curl-like profile is used instead
/// (spec §4.1, §6 header policy).
const CURL_PROFILE_DOMAINS: &[&str] = &["sundelaware.com", "sunbehavioral.com"];

/// Builds the TLS connector used by every `HttpFetcher`. Some hospital servers (Beth Israel
/// Deaconess, Beverly Hospital, Mount Auburn, and others on aging load balancers) still require
/// unsafe legacy renegotiation, which OpenSSL 3 refuses by default; plain `danger_accept_invalid_certs`
/// does nothing for that and the handshake fails outright (spec §4.1).
fn legacy_tls_connector() -> Result<native_tls::TlsConnector> {
    let mut builder = openssl::ssl::SslConnector::builder(openssl::ssl::SslMethod::tls())
        .map_err(|e| Error::ConnectionError(e.to_string()))?;
    // SSL_OP_LEGACY_SERVER_CONNECT (0x4) isn't exposed as a named constant by the `openssl`
    // crate's safe wrapper, so it's reconstructed from its well-known raw bit value.
    builder.set_options(
        openssl::ssl::SslOptions::from_bits_retain(0x0000_0004)
            | openssl::ssl::SslOptions::ALLOW_UNSAFE_LEGACY_RENEGOTIATION,
    );
    builder.set_verify(openssl::ssl::SslVerifyMode::NONE);
    Ok(builder.build().into())
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let tls = legacy_tls_connector()?;
        let client = reqwest::Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(120))
            .use_preconfigured_tls(tls)
            .build()
            .map_err(|e| Error::ConnectionError(e.to_string()))?;
        Ok(Self { client })
    }

    fn user_agent_for(url: &str) -> &'static str {
        let host = reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
            .unwrap_or_default();
        if CURL_PROFILE_DOMAINS
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{d}")))
        {
            CURL_LIKE_USER_AGENT
        } else {
            DEFAULT_USER_AGENT
        }
    }

    /// Jitter source: subsec-nanos of the current time, folded into `[0, max_ms)`. Avoids pulling
    /// in a dedicated RNG crate for a single bounded dither value.
    fn jitter_ms(max_ms: u64) -> u64 {
        if max_ms == 0 {
            return 0;
        }
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        (nanos as u64) % max_ms
    }

    fn backoff_delay(attempt: u32) -> Duration {
        let base_ms = 500u64.saturating_mul(1u64 << attempt.min(6));
        let jittered = base_ms + Self::jitter_ms(base_ms / 2 + 1);
        Duration::from_millis(jittered).min(MAX_BACKOFF)
    }

    fn classify_status(status: reqwest::StatusCode, url: &str) -> Option<Error> {
        if status.is_success() {
            return None;
        }
        if status.as_u16() == 429 || status.is_server_error() {
            Some(Error::RetryableHttpError(format!(
                "{} from {url}",
                status.as_u16()
            )))
        } else {
            Some(Error::PermanentHttpError {
                status: status.as_u16(),
                url: url.to_string(),
            })
        }
    }

    async fn send_with_retries(&self, url: &str) -> Result<reqwest::Response> {
        let rewritten = crate::rewrite::rewrite_url(url);
        let mut last_err = Error::ConnectionError("no attempt made".to_string());
        for attempt in 0..MAX_RETRIES {
            let ua = Self::user_agent_for(&rewritten);
            let send_result = self
                .client
                .get(&rewritten)
                .header(reqwest::header::USER_AGENT, ua)
                .send()
                .await;

            match send_result {
                Ok(resp) => {
                    if let Some(err) = Self::classify_status(resp.status(), &rewritten) {
                        if err.is_retryable() && attempt + 1 < MAX_RETRIES {
                            last_err = err;
                            tokio::time::sleep(Self::backoff_delay(attempt)).await;
                            continue;
                        }
                        return Err(err);
                    }
                    return crate::rewrite::resolve_drive_virus_scan(&self.client, resp).await;
                }
                Err(e) => {
                    let err = if e.is_timeout() {
                        Error::Timeout
                    } else {
                        Error::ConnectionError(e.to_string())
                    };
                    if err.is_retryable() && attempt + 1 < MAX_RETRIES {
                        last_err = err;
                        tokio::time::sleep(Self::backoff_delay(attempt)).await;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
        Err(last_err)
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new().expect("default reqwest client configuration must be valid")
    }
}

#[async_trait::async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self.send_with_retries(url).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| Error::ConnectionError(e.to_string()))?;
        if crate::archive::looks_like_html(&bytes) {
            return Err(Error::HtmlInsteadOfData);
        }
        Ok(bytes.to_vec())
    }

    async fn fetch_json(&self, url: &str) -> Result<serde_json::Value> {
        let bytes = self.fetch(url).await?;
        let trimmed = strip_bom(&bytes);
        serde_json::from_slice(trimmed).map_err(|e| Error::JsonDecodeError(e.to_string()))
    }

    async fn fetch_to_tempfile(&self, url: &str) -> Result<PathBuf> {
        let resp = self.send_with_retries(url).await?;
        let ext = guess_extension(&resp, url);
        let tmp = tempfile::Builder::new()
            .prefix("mrf-")
            .suffix(&ext)
            .tempfile()
            .map_err(|e| Error::Io(e.to_string()))?;
        let (file, path) = tmp.keep().map_err(|e| Error::Io(e.to_string()))?;
        let mut file = tokio::fs::File::from_std(file);

        let mut stream = resp.bytes_stream();
        use futures_util::StreamExt;
        let write_result = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| Error::ConnectionError(e.to_string()))?;
                file.write_all(&chunk)
                    .await
                    .map_err(|e| Error::Io(e.to_string()))?;
            }
            file.flush().await.map_err(|e| Error::Io(e.to_string()))?;
            Ok::<(), Error>(())
        }
        .await;

        match write_result {
            Ok(()) => Ok(path),
            Err(e) => {
                let _ = tokio::fs::remove_file(&path).await;
                Err(e)
            }
        }
    }

    async fn probe_content_length(&self, url: &str) -> Result<Option<u64>> {
        let rewritten = crate::rewrite::rewrite_url(url);
        let head = self
            .client
            .head(&rewritten)
            .header(reqwest::header::USER_AGENT, Self::user_agent_for(&rewritten))
            .send()
            .await;
        match head {
            Ok(resp) if resp.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED => {
                self.probe_via_get(&rewritten).await
            }
            Ok(resp) => Ok(resp.content_length()),
            Err(_) => self.probe_via_get(&rewritten).await,
        }
    }

    async fn check_url(&self, url: &str) -> UrlCheck {
        match self.send_with_retries(url).await {
            Ok(_) => UrlCheck {
                accessible: true,
                reason: "ok".to_string(),
            },
            Err(e) => UrlCheck {
                accessible: false,
                reason: e.to_string(),
            },
        }
    }
}

impl HttpFetcher {
    async fn probe_via_get(&self, url: &str) -> Result<Option<u64>> {
        let resp = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, Self::user_agent_for(url))
            .send()
            .await
            .map_err(|e| Error::ConnectionError(e.to_string()))?;
        Ok(resp.content_length())
    }
}

fn strip_bom(bytes: &[u8]) -> &[u8] {
    bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes)
}

fn guess_extension(resp: &reqwest::Response, url: &str) -> String {
    if let Some(ct) = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        if ct.contains("json") {
            return ".json".to_string();
        }
        if ct.contains("zip") {
            return ".zip".to_string();
        }
        if ct.contains("csv") {
            return ".csv".to_string();
        }
    }
    for (ext, suffix) in [
        (".json", ".json"),
        (".zip", ".zip"),
        (".csv", ".csv"),
        (".xlsx", ".xlsx"),
    ] {
        if url.to_ascii_lowercase().ends_with(ext) {
            return suffix.to_string();
        }
    }
    ".bin".to_string()
}

/// Whether `probe_content_length` indicates the payload should stream to disk (spec §4.1).
pub fn should_stream(len: Option<u64>) -> bool {
    len.map(|n| n > STREAMING_THRESHOLD_BYTES).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn retries_on_5xx_then_succeeds() {
        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = hits.clone();
        let app = Router::new().route(
            "/",
            get(move || {
                let hits = hits2.clone();
                async move {
                    let n = hits.fetch_add(1, Ordering::SeqCst);
                    if n < 1 {
                        (StatusCode::SERVICE_UNAVAILABLE, "")
                    } else {
                        (StatusCode::OK, "ok-body")
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let fetcher = HttpFetcher::new().unwrap();
        let bytes = fetcher.fetch(&format!("http://{addr}/")).await.unwrap();
        assert_eq!(bytes, b"ok-body");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_4xx_is_not_retried() {
        let hits = Arc::new(AtomicU32::new(0));
        let hits2 = hits.clone();
        let app = Router::new().route(
            "/",
            get(move || {
                let hits = hits2.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    (StatusCode::NOT_FOUND, "nope")
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let fetcher = HttpFetcher::new().unwrap();
        let err = fetcher.fetch(&format!("http://{addr}/")).await.unwrap_err();
        assert!(matches!(err, Error::PermanentHttpError { status: 404, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn html_body_is_detected_as_error() {
        let app = Router::new().route(
            "/",
            get(|| async { "<!DOCTYPE html><html><body>nope</body></html>" }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let fetcher = HttpFetcher::new().unwrap();
        let err = fetcher.fetch(&format!("http://{addr}/")).await.unwrap_err();
        assert!(matches!(err, Error::HtmlInsteadOfData));
    }

    #[tokio::test]
    async fn curl_user_agent_used_for_sun_domains() {
        assert_eq!(
            HttpFetcher::user_agent_for("https://sundelaware.com/x.xlsx"),
            CURL_LIKE_USER_AGENT
        );
        assert_eq!(
            HttpFetcher::user_agent_for("https://www.sunbehavioral.com/x.xlsx"),
            CURL_LIKE_USER_AGENT
        );
        assert_eq!(
            HttpFetcher::user_agent_for("https://example.com/x.csv"),
            DEFAULT_USER_AGENT
        );
    }

    #[test]
    fn should_stream_above_threshold_only() {
        assert!(!should_stream(None));
        assert!(!should_stream(Some(1024)));
        assert!(should_stream(Some(STREAMING_THRESHOLD_BYTES + 1)));
    }

    #[test]
    fn jitter_is_bounded() {
        for _ in 0..20 {
            assert!(HttpFetcher::jitter_ms(100) < 100);
        }
        assert_eq!(HttpFetcher::jitter_ms(0), 0);
    }
}
