// 📥 Resilient Fetcher - period discovery and downloads with retry/backoff
//
// The portal is a plain directory listing:
//   {base}/                     → year links    href="2025/"
//   {base}/{year}/              → quarter dirs  href="1T/"  or flat files href="1T2025.zip"
//   {base}/{year}/{q}T/         → zip files
//
// Failures here never abort a run: callers get partial result sets.

use regex::Regex;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::STATEMENTS_URL;
use crate::error::{PipelineError, Result};
use crate::records::Period;

pub const CHUNK_SIZE: usize = 8192;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

const RELEVANT_TOKENS: [&str; 6] = ["despesa", "evento", "sinistro", "expense", "event", "claim"];

// ============================================================================
// HTTP CAPABILITY
// ============================================================================

pub struct HttpResponse {
    pub status: u16,
    /// Declared body length, when the server sent one
    pub content_length: Option<u64>,
    pub body: Box<dyn Read + Send>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Read the whole body as text (listing pages are small)
    pub fn text(mut self) -> Result<String> {
        let mut bytes = Vec::new();
        self.body.read_to_end(&mut bytes)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Minimal GET-only client. Anything that can stream a body will do.
pub trait HttpClient: Send + Sync {
    fn get(&self, url: &str) -> Result<HttpResponse>;
}

pub struct ReqwestHttpClient {
    client: reqwest::blocking::Client,
}

impl ReqwestHttpClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::transport("client builder", e.to_string()))?;
        Ok(ReqwestHttpClient { client })
    }
}

impl HttpClient for ReqwestHttpClient {
    fn get(&self, url: &str) -> Result<HttpResponse> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| PipelineError::transport(url, e.to_string()))?;

        Ok(HttpResponse {
            status: response.status().as_u16(),
            content_length: response.content_length(),
            body: Box::new(response),
        })
    }
}

// ============================================================================
// RETRY POLICY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Wait after failed attempt `attempt` (1-based): base * 2^attempt
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

// ============================================================================
// FETCHER
// ============================================================================

pub struct Fetcher {
    client: Box<dyn HttpClient>,
    base_url: String,
    dest_dir: PathBuf,
    retry: RetryPolicy,
    /// Pause between periods in `download_latest`
    period_pause: Duration,
}

impl Fetcher {
    pub fn new(client: Box<dyn HttpClient>, dest_dir: impl Into<PathBuf>) -> Self {
        Fetcher {
            client,
            base_url: STATEMENTS_URL.to_string(),
            dest_dir: dest_dir.into(),
            retry: RetryPolicy::default(),
            period_pause: Duration::from_secs(2),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_period_pause(mut self, pause: Duration) -> Self {
        self.period_pause = pause;
        self
    }

    pub fn dest_dir(&self) -> &Path {
        &self.dest_dir
    }

    pub fn client(&self) -> &dyn HttpClient {
        self.client.as_ref()
    }

    fn year_url(&self, year: i32) -> String {
        format!("{}/{}/", self.base_url, year)
    }

    fn quarter_url(&self, year: i32, quarter: u8) -> String {
        format!("{}/{}/{}T/", self.base_url, year, quarter)
    }

    fn fetch_listing(&self, url: &str) -> Result<String> {
        let response = self.client.get(url)?;
        if !response.is_success() {
            return Err(PipelineError::transport(url, format!("HTTP {}", response.status)));
        }
        response.text()
    }

    // ------------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------------

    /// Available periods, most recent first. Empty when the root index fails.
    pub fn list_periods(&self) -> Vec<Period> {
        let root_url = format!("{}/", self.base_url);
        let root = match self.fetch_listing(&root_url) {
            Ok(text) => text,
            Err(e) => {
                error!("could not list available periods: {}", e);
                return Vec::new();
            }
        };

        let mut years: Vec<i32> = capture_all(r#"href="(\d{4})/""#, &root)
            .iter()
            .filter_map(|y| y.parse().ok())
            .collect();
        years.sort_unstable_by(|a, b| b.cmp(a));
        years.dedup();

        let mut periods = Vec::new();
        for year in years {
            let listing = match self.fetch_listing(&self.year_url(year)) {
                Ok(text) => text,
                Err(e) => {
                    warn!("skipping year {}: {}", year, e);
                    continue;
                }
            };

            let mut quarters: Vec<u8> = capture_all(r#"(?i)href="(\d)T/""#, &listing)
                .into_iter()
                .chain(capture_all(r#"(?i)href="(\d)T\d{4}\.zip""#, &listing))
                .filter_map(|q| q.parse().ok())
                .filter(|q| (1..=4).contains(q))
                .collect();
            quarters.sort_unstable_by(|a, b| b.cmp(a));
            quarters.dedup();

            periods.extend(quarters.into_iter().map(|q| Period::new(year, q)));
        }

        periods
    }

    /// Relevant zip files for one period. The quarter directory is tried
    /// first; a 404 there means the year uses flat `{q}T{year}.zip` files.
    pub fn list_files(&self, year: i32, quarter: u8) -> Vec<String> {
        info!("listing files for {}", Period::new(year, quarter));

        let listing = match self.period_listing(year, quarter) {
            Ok(text) => text,
            Err(e) => {
                error!("could not list files for {}/Q{}: {}", year, quarter, e);
                return Vec::new();
            }
        };

        let relevant: Vec<String> = capture_all(r#"(?i)href="([^"]*\.zip)""#, &listing)
            .into_iter()
            .filter(|name| is_relevant_file(name, year, quarter))
            .collect();

        info!("found {} relevant files", relevant.len());
        relevant
    }

    fn period_listing(&self, year: i32, quarter: u8) -> Result<String> {
        let url = self.quarter_url(year, quarter);
        let response = self.client.get(&url)?;
        if response.status == 404 {
            debug!("{} not found, falling back to year index", url);
            return self.fetch_listing(&self.year_url(year));
        }
        if !response.is_success() {
            return Err(PipelineError::transport(&url, format!("HTTP {}", response.status)));
        }
        response.text()
    }

    // ------------------------------------------------------------------------
    // Downloads
    // ------------------------------------------------------------------------

    /// Download into the fetcher's directory under `destination_name`
    pub fn download(&self, url: &str, destination_name: &str) -> Result<PathBuf> {
        self.download_to(url, &self.dest_dir.join(destination_name))
    }

    /// Download with retry. An existing non-empty file counts as done. On
    /// final failure no partial file is left behind.
    pub fn download_to(&self, url: &str, destination: &Path) -> Result<PathBuf> {
        if let Ok(meta) = fs::metadata(destination) {
            if meta.len() > 0 {
                info!("already downloaded: {} ({} bytes)", destination.display(), meta.len());
                return Ok(destination.to_path_buf());
            }
        }

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }

        let attempts = self.retry.max_retries.max(1);
        let mut last_error = PipelineError::transport(url, "no attempt made");

        for attempt in 1..=attempts {
            info!("downloading {} (attempt {}/{})", url, attempt, attempts);

            match self.attempt_download(url, destination) {
                Ok(bytes) => {
                    info!("downloaded {} ({} bytes)", destination.display(), bytes);
                    return Ok(destination.to_path_buf());
                }
                Err(e) => {
                    warn!("attempt {} failed: {}", attempt, e);
                    let _ = fs::remove_file(destination);
                    if !e.is_transient() {
                        return Err(e);
                    }
                    last_error = e;

                    if attempt < attempts {
                        let wait = self.retry.delay_after(attempt);
                        debug!("waiting {:?} before retrying", wait);
                        thread::sleep(wait);
                    }
                }
            }
        }

        error!("giving up on {} after {} attempts", url, attempts);
        Err(last_error)
    }

    fn attempt_download(&self, url: &str, destination: &Path) -> Result<u64> {
        let mut response = self.client.get(url)?;
        if !response.is_success() {
            return Err(PipelineError::transport(url, format!("HTTP {}", response.status)));
        }

        let mut file = File::create(destination)?;
        let mut buffer = [0u8; CHUNK_SIZE];
        let mut written: u64 = 0;

        loop {
            let read = response
                .body
                .read(&mut buffer)
                .map_err(|e| PipelineError::transport(url, e.to_string()))?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])?;
            written += read as u64;
        }
        file.flush()?;

        if let Some(expected) = response.content_length.filter(|n| *n > 0) {
            if expected != written {
                return Err(PipelineError::transport(
                    url,
                    format!("size mismatch: expected {}, received {}", expected, written),
                ));
            }
        }

        Ok(written)
    }

    /// Download every relevant file of a period as `{year}_Q{q}_{name}`.
    /// Returns only the files that made it.
    pub fn download_period(&self, year: i32, quarter: u8) -> Vec<PathBuf> {
        let files = self.list_files(year, quarter);
        if files.is_empty() {
            warn!("no files found for {}", Period::new(year, quarter));
            return Vec::new();
        }

        let mut downloaded = Vec::new();
        for (idx, name) in files.iter().enumerate() {
            let file_name = decoded_name(name);
            info!("[{}/{}] {}", idx + 1, files.len(), file_name);

            let url = self.file_url(year, quarter, name, &file_name);
            let destination = format!("{}_Q{}_{}", year, quarter, file_name);

            match self.download(&url, &destination) {
                Ok(path) => downloaded.push(path),
                Err(e) => warn!("skipping {}: {}", file_name, e),
            }
        }

        info!(
            "{}: {}/{} files downloaded",
            Period::new(year, quarter),
            downloaded.len(),
            files.len()
        );
        downloaded
    }

    fn file_url(&self, year: i32, quarter: u8, href: &str, file_name: &str) -> String {
        if href.starts_with("http://") || href.starts_with("https://") {
            return href.to_string();
        }
        let encoded = urlencoding::encode(file_name);
        if file_name.to_lowercase() == format!("{}t{}.zip", quarter, year) {
            format!("{}{}", self.year_url(year), encoded)
        } else {
            format!("{}{}", self.quarter_url(year, quarter), encoded)
        }
    }

    /// Download the `count` most recent periods
    pub fn download_latest(&self, count: usize) -> Vec<(Period, Vec<PathBuf>)> {
        let periods = self.list_periods();
        if periods.is_empty() {
            warn!("no periods available on the portal");
            return Vec::new();
        }

        let selected: Vec<Period> = periods.into_iter().take(count).collect();
        let mut results = Vec::new();

        for (idx, period) in selected.iter().enumerate() {
            info!("period {}/{}: {}", idx + 1, selected.len(), period);
            let files = self.download_period(period.year, period.quarter);
            results.push((*period, files));

            if idx + 1 < selected.len() && !self.period_pause.is_zero() {
                thread::sleep(self.period_pause);
            }
        }

        results
    }
}

// ============================================================================
// HELPERS
// ============================================================================

pub(crate) fn capture_all(pattern: &str, text: &str) -> Vec<String> {
    match Regex::new(pattern) {
        Ok(re) => re
            .captures_iter(text)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect(),
        Err(e) => {
            error!("bad listing pattern {}: {}", pattern, e);
            Vec::new()
        }
    }
}

/// Expense/event/claim vocabulary, or the flat `{q}T{year}.zip` bundle
pub fn is_relevant_file(name: &str, year: i32, quarter: u8) -> bool {
    let lower = name.to_lowercase();
    RELEVANT_TOKENS.iter().any(|t| lower.contains(t))
        || lower.contains(&format!("{}t{}.zip", quarter, year))
}

/// Last path segment of an href, percent-decoded
fn decoded_name(href: &str) -> String {
    let last = href.rsplit('/').next().unwrap_or(href);
    urlencoding::decode(last)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| last.to_string())
}

// ============================================================================
// TEST DOUBLES
// ============================================================================
