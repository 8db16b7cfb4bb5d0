//! Fetch collaborator: GET a URI, get bytes plus freshness metadata.
//!
//! [`fetch_cached`] puts the [`ResourceCache`] in front of any [`Fetcher`].

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheEntry, FreshnessPolicy, ResourceCache};
use crate::error::{Result, VxiError};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchResponse {
    pub body: Vec<u8>,
    pub date: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
    /// Lower-cased `Cache-Control` directives, e.g. `no-store`, `max-age=60`.
    pub cache_control: Vec<String>,
}

impl FetchResponse {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn no_store(&self) -> bool {
        self.cache_control
            .iter()
            .any(|d| d == "no-store" || d == "no-cache")
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.cache_control.iter().find_map(|d| {
            d.strip_prefix("max-age=")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
        })
    }

    /// Expiry implied by the response headers, if any.
    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        if let Some(age) = self.max_age() {
            let base = self.date.unwrap_or_else(Utc::now);
            return chrono::Duration::from_std(age).ok().map(|d| base + d);
        }
        self.expires
    }
}

pub trait Fetcher: Send + Sync {
    fn fetch(&self, uri: &str, timeout: Duration) -> Result<FetchResponse>;
}

/// Resolve `target` against the URI of the document that referenced it.
///
/// Absolute bases (`http://`, `file://`) resolve per RFC 3986 through
/// [`Url::join`]. Relative path bases and opaque ones such as `mem:` fall back
/// to a directory join with dot segments collapsed.
pub fn resolve_uri(base: &str, target: &str) -> String {
    let target = target.trim();
    if target.starts_with("builtin:") || Url::parse(target).is_ok() {
        return target.to_string();
    }
    if let Ok(base_url) = Url::parse(base) {
        if !base_url.cannot_be_a_base() {
            if let Ok(joined) = base_url.join(target) {
                return joined.into();
            }
        }
        return target.to_string();
    }
    if target.starts_with('/') {
        return target.to_string();
    }
    let base = base.split(['?', '#']).next().unwrap_or("");
    match base.rfind('/') {
        Some(idx) => normalize_segments(&format!("{}{}", &base[..=idx], target)),
        None => normalize_segments(target),
    }
}

/// Collapse `.` and `name/..` segments of a relative path. Leading `..`
/// segments that climb above the start are kept.
fn normalize_segments(path: &str) -> String {
    let (path, suffix) = match path.find(['?', '#']) {
        Some(idx) => path.split_at(idx),
        None => (path, ""),
    };
    let mut out: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "." => {}
            ".." if out.last().is_some_and(|last| *last != "..") => {
                out.pop();
            }
            _ => out.push(seg),
        }
    }
    format!("{}{suffix}", out.join("/"))
}

/// Reads `file://` URIs and bare paths relative to a root directory.
#[derive(Debug, Clone)]
pub struct FileFetcher {
    root: PathBuf,
}

impl FileFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, uri: &str) -> PathBuf {
        if uri.starts_with("file:") {
            if let Some(path) = Url::parse(uri).ok().and_then(|u| u.to_file_path().ok()) {
                return path;
            }
        }
        let raw = uri.split(['?', '#']).next().unwrap_or(uri);
        let path = Path::new(raw);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

impl Fetcher for FileFetcher {
    fn fetch(&self, uri: &str, _timeout: Duration) -> Result<FetchResponse> {
        let path = self.path_for(uri);
        let body = std::fs::read(&path).map_err(|e| {
            let status = match e.kind() {
                std::io::ErrorKind::NotFound => "notfound",
                std::io::ErrorKind::PermissionDenied => "denied",
                _ => "io",
            };
            VxiError::bad_fetch(uri, "file", status)
        })?;
        let date = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        debug!(uri, bytes = body.len(), "file fetched");
        Ok(FetchResponse {
            body,
            date,
            ..FetchResponse::default()
        })
    }
}

/// Blocking HTTP(S) fetcher.
#[cfg(feature = "http")]
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

#[cfg(feature = "http")]
impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("vxi/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| VxiError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self { client })
    }
}

#[cfg(feature = "http")]
impl Fetcher for HttpFetcher {
    fn fetch(&self, uri: &str, timeout: Duration) -> Result<FetchResponse> {
        let response = self
            .client
            .get(uri)
            .timeout(timeout)
            .send()
            .map_err(|e| {
                warn!(uri, error = %e, "http request failed");
                let status = if e.is_timeout() { "timeout" } else { "connect" };
                VxiError::bad_fetch(uri, "http", status)
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(VxiError::bad_fetch(uri, "http", status.as_u16().to_string()));
        }
        let header = |name: reqwest::header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let http_date = |raw: Option<String>| {
            raw.and_then(|v| DateTime::parse_from_rfc2822(&v).ok())
                .map(|d| d.with_timezone(&Utc))
        };
        let date = http_date(header(reqwest::header::DATE));
        let expires = http_date(header(reqwest::header::EXPIRES));
        let cache_control = header(reqwest::header::CACHE_CONTROL)
            .map(|v| {
                v.split(',')
                    .map(|d| d.trim().to_ascii_lowercase())
                    .filter(|d| !d.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let body = response
            .bytes()
            .map_err(|_| VxiError::bad_fetch(uri, "http", "body"))?
            .to_vec();
        debug!(uri, bytes = body.len(), "http fetched");
        Ok(FetchResponse {
            body,
            date,
            expires,
            cache_control,
        })
    }
}

/// Fetch through the cache. Fresh entries are served without touching the
/// fetcher; `no-store` responses are passed through uncached.
pub fn fetch_cached(
    cache: Option<&ResourceCache>,
    fetcher: &dyn Fetcher,
    uri: &str,
    policy: FreshnessPolicy,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let Some(cache) = cache else {
        return fetcher.fetch(uri, timeout).map(|r| r.body);
    };
    let key = format!("fetch|{uri}");
    let mut writer = match cache.start_entry(&key, policy)? {
        CacheEntry::Hit(reader) => match reader.into_bytes() {
            Ok(bytes) => return Ok(bytes),
            Err(e) => {
                warn!(uri, error = %e, "cache entry unreadable; refetching");
                return fetcher.fetch(uri, timeout).map(|r| r.body);
            }
        },
        CacheEntry::Miss(writer) => writer,
    };
    let response = match fetcher.fetch(uri, timeout) {
        Ok(r) => r,
        Err(e) => {
            writer.finish(false)?;
            return Err(e);
        }
    };
    if response.no_store() {
        writer.finish(false)?;
        return Ok(response.body);
    }
    if let Some(expiry) = response.expiry() {
        writer.set_expiry(expiry);
    }
    writer.write_all(&response.body)?;
    writer.finish(true)?;
    Ok(response.body)
}
