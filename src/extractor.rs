mod embedded;
mod mobile;
mod pattern;
mod piped;
mod ytdlp;

use std::{fmt, time::Duration};

use async_trait::async_trait;
use http_types::Url;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{
  header::{self, HeaderMap, HeaderValue},
  StatusCode,
};
use serde::Serialize;

use crate::{
  error::StrategyError,
  retry::RetryPolicy,
  source::{Platform, SourceRequest},
};

pub use embedded::EmbeddedJson;
pub use mobile::MobileScrape;
pub use pattern::PatternScan;
pub use piped::{Piped, PipedInstance};
pub use ytdlp::Ytdlp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyId {
  StructuredApi,
  MobileScrape,
  PatternScan,
  EmbeddedJson,
  Generic,
}

impl fmt::Display for StrategyId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      StrategyId::StructuredApi => "structured-api",
      StrategyId::MobileScrape => "mobile-scrape",
      StrategyId::PatternScan => "pattern-scan",
      StrategyId::EmbeddedJson => "embedded-json",
      StrategyId::Generic => "generic",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantKind {
  Muxed,
  VideoOnly,
  AudioOnly,
}

/// One downloadable rendition of the media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
  pub url: String,
  /// Headers the media host expects on the download request.
  pub headers: Vec<(String, String)>,
  pub kind: VariantKind,
  /// File extension of the container, e.g. `mp4` or `m4a`.
  pub container: String,
  pub height: Option<u32>,
  pub bitrate_kbps: Option<u32>,
  /// Declared size in bytes; unknown until fetched for most scrapers.
  pub size: Option<u64>,
}

impl Variant {
  pub fn new(
    url: impl Into<String>,
    kind: VariantKind,
    container: impl Into<String>,
  ) -> Self {
    Self {
      url: url.into(),
      headers: vec![],
      kind,
      container: container.into(),
      height: None,
      bitrate_kbps: None,
      size: None,
    }
  }

  pub fn with_height(self, height: Option<u32>) -> Self {
    Self { height, ..self }
  }

  pub fn with_bitrate(self, bitrate_kbps: Option<u32>) -> Self {
    Self {
      bitrate_kbps,
      ..self
    }
  }

  pub fn with_size(self, size: Option<u64>) -> Self {
    Self { size, ..self }
  }

  pub fn with_headers(self, headers: Vec<(String, String)>) -> Self {
    Self { headers, ..self }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMedia {
  pub platform: Platform,
  pub title: Option<String>,
  pub variants: Vec<Variant>,
}

#[async_trait]
pub trait Extractor: Send + Sync {
  fn id(&self) -> StrategyId;

  /// Deadline for one invocation, internal retries included.
  fn timeout(&self) -> Duration;

  async fn extract(
    &self,
    request: &SourceRequest,
  ) -> Result<ResolvedMedia, StrategyError>;
}

/// The closed set of extraction methods the resolver can chain.
#[derive(Clone)]
pub enum Strategy {
  StructuredApi(Piped),
  MobileScrape(MobileScrape),
  PatternScan(PatternScan),
  EmbeddedJson(EmbeddedJson),
  Generic(Ytdlp),
}

#[async_trait]
impl Extractor for Strategy {
  fn id(&self) -> StrategyId {
    match self {
      Strategy::StructuredApi(s) => s.id(),
      Strategy::MobileScrape(s) => s.id(),
      Strategy::PatternScan(s) => s.id(),
      Strategy::EmbeddedJson(s) => s.id(),
      Strategy::Generic(s) => s.id(),
    }
  }

  fn timeout(&self) -> Duration {
    match self {
      Strategy::StructuredApi(s) => s.timeout(),
      Strategy::MobileScrape(s) => s.timeout(),
      Strategy::PatternScan(s) => s.timeout(),
      Strategy::EmbeddedJson(s) => s.timeout(),
      Strategy::Generic(s) => s.timeout(),
    }
  }

  async fn extract(
    &self,
    request: &SourceRequest,
  ) -> Result<ResolvedMedia, StrategyError> {
    match self {
      Strategy::StructuredApi(s) => s.extract(request).await,
      Strategy::MobileScrape(s) => s.extract(request).await,
      Strategy::PatternScan(s) => s.extract(request).await,
      Strategy::EmbeddedJson(s) => s.extract(request).await,
      Strategy::Generic(s) => s.extract(request).await,
    }
  }
}

pub const DESKTOP_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
  AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
pub const ANDROID_UA: &str = "Mozilla/5.0 (Linux; Android 11; SM-G998B) \
  AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36";
pub const IPHONE_UA: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 14_6 like Mac OS X) \
  AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.0 Mobile/15E148 Safari/604.1";

pub fn browser_headers(user_agent: &'static str) -> HeaderMap {
  let mut headers = HeaderMap::new();
  headers.insert(header::USER_AGENT, HeaderValue::from_static(user_agent));
  headers.insert(
    header::ACCEPT,
    HeaderValue::from_static(
      "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
    ),
  );
  headers.insert(
    header::ACCEPT_LANGUAGE,
    HeaderValue::from_static("en-US,en;q=0.9"),
  );
  headers
}

/// Page fetcher shared by the HTTP based strategies.
#[derive(Clone)]
pub struct Http {
  client: reqwest::Client,
  retry: RetryPolicy,
  request_timeout: Duration,
}

impl Http {
  pub fn new(client: reqwest::Client, retry: RetryPolicy) -> Self {
    Self {
      client,
      retry,
      request_timeout: Duration::from_secs(8),
    }
  }

  pub fn with_request_timeout(self, request_timeout: Duration) -> Self {
    Self {
      request_timeout,
      ..self
    }
  }

  /// Time one retried request may take, every attempt included. Strategy
  /// deadlines are derived from it so the retry policy can run its course.
  pub fn budget(&self) -> Duration {
    self.retry.worst_case(self.request_timeout) + Duration::from_secs(1)
  }

  /// GETs `url` and hands status, final url and body to `parse`. Transport
  /// failures and retriable errors returned by `parse` are retried.
  pub async fn get_with<T, F>(
    &self,
    url: &str,
    headers: &HeaderMap,
    parse: F,
  ) -> Result<T, StrategyError>
  where
    F: Fn(StatusCode, Url, String) -> Result<T, StrategyError>,
  {
    let parse = &parse;
    self
      .retry
      .run(|_| {
        let request = self
          .client
          .get(url)
          .headers(headers.clone())
          .timeout(self.request_timeout);
        async move {
          let resp = request.send().await?;
          let status = resp.status();
          let final_url = resp.url().clone();
          let body = resp.text().await?;
          parse(status, final_url, body)
        }
      })
      .await
      .result
  }

  /// GETs a page, following redirects. Returns the final url and the body.
  pub async fn get_text(
    &self,
    url: &str,
    headers: &HeaderMap,
  ) -> Result<(Url, String), StrategyError> {
    self
      .get_with(url, headers, |status, final_url, body| {
        match StrategyError::from_status(status) {
          Some(err) => Err(err),
          None => Ok((final_url, body)),
        }
      })
      .await
  }

  /// Follows redirects with HEAD requests and returns where they end.
  pub async fn expand(&self, url: &str) -> Result<Url, StrategyError> {
    self
      .retry
      .run(|_| {
        let request = self
          .client
          .head(url)
          .header(header::USER_AGENT, DESKTOP_UA)
          .timeout(self.request_timeout);
        async move {
          let resp = request.send().await?;
          match StrategyError::from_status(resp.status()) {
            Some(err) => Err(err),
            None => Ok(resp.url().clone()),
          }
        }
      })
      .await
      .result
  }
}

pub const FACEBOOK_CDN: &[&str] = &["fbcdn.net"];

/// Resolves `fb.watch` short links and moves the page onto `host`.
pub async fn facebook_page(
  http: &Http,
  url: &Url,
  host: &str,
) -> Result<Url, StrategyError> {
  let mut page = match url.host_str() {
    Some(h) if h.eq_ignore_ascii_case("fb.watch") => {
      http.expand(url.as_str()).await?
    }
    _ => url.clone(),
  };

  let on_facebook = page.host_str().map_or(false, |h| {
    let h = h.to_ascii_lowercase();
    h == "facebook.com" || h.ends_with(".facebook.com")
  });
  if !on_facebook {
    return Err(StrategyError::Unsupported(format!(
      "not a facebook page: {page}"
    )));
  }

  page
    .set_host(Some(host))
    .map_err(|e| StrategyError::Other(e.to_string()))?;
  Ok(page)
}

const MEDIA_EXTENSIONS: &[&str] = &[".mp4", ".m4a", ".webm", ".mov", ".mp3"];

/// Accepts a scraped candidate only if it is an absolute http(s) url that
/// points at a media file or at one of the given CDN hosts.
pub fn media_url(candidate: &str, cdn_hosts: &[&str]) -> Option<Url> {
  let url: Url = candidate.trim().parse().ok()?;
  if !matches!(url.scheme(), "http" | "https") {
    return None;
  }

  let host = url.host_str()?.to_ascii_lowercase();
  let on_cdn = cdn_hosts.iter().any(|cdn| {
    host == *cdn
      || host
        .strip_suffix(cdn)
        .map_or(false, |prefix| prefix.ends_with('.'))
  });
  let path = url.path().to_ascii_lowercase();
  let media_path = MEDIA_EXTENSIONS.iter().any(|ext| path.ends_with(ext));

  (on_cdn || media_path).then_some(url)
}

static UNICODE_ESCAPE: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"\\u([0-9a-fA-F]{4})").unwrap());

/// Undoes the escaping found in urls embedded in scripts and attributes.
pub fn unescape_scraped(raw: &str) -> String {
  let unescaped = UNICODE_ESCAPE.replace_all(raw, |caps: &regex::Captures| {
    u32::from_str_radix(&caps[1], 16)
      .ok()
      .and_then(char::from_u32)
      .map(String::from)
      .unwrap_or_else(|| caps[0].to_string())
  });

  unescaped.replace("\\/", "/").replace("&amp;", "&")
}

pub fn title_from_html(dom: &tl::VDom<'_>) -> Option<String> {
  let node = dom.query_selector("title")?.next()?;
  let title = node.get(dom.parser())?.inner_text(dom.parser());
  let title = title.trim();
  (!title.is_empty()).then(|| title.to_string())
}

#[cfg(test)]
mod test {
  use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
  };

  use axum::{routing::get, Router};

  use super::*;
  use crate::fetch::test::serve;

  #[tokio::test]
  async fn test_hung_upstream_gets_every_attempt() {
    let hits = Arc::new(AtomicU32::new(0));
    let router = Router::new().route(
      "/page",
      get({
        let hits = hits.clone();
        move || async move {
          hits.fetch_add(1, Ordering::SeqCst);
          tokio::time::sleep(Duration::from_secs(3600)).await;
          "never"
        }
      }),
    );
    let addr = serve(router);

    let http = Http::new(
      reqwest::Client::new(),
      RetryPolicy::new(3, Duration::from_millis(20)),
    )
    .with_request_timeout(Duration::from_millis(200));
    let page = format!("http://{addr}/page");

    let result = tokio::time::timeout(
      http.budget(),
      http.get_text(&page, &HeaderMap::new()),
    )
    .await;

    assert_eq!(result, Ok(Err(StrategyError::Timeout)));
    assert_eq!(hits.load(Ordering::SeqCst), 3);
  }

  #[test]
  fn test_media_url_validation() {
    let cdn = &["fbcdn.net"];

    assert!(media_url(
      "https://video.xx.fbcdn.net/v/t42/123_n.mp4?efg=abc",
      cdn
    )
    .is_some());
    // known cdn, no extension
    let url = "https://scontent.fbcdn.net/v/stream?x=1";
    assert!(media_url(url, cdn).is_some());
    // media extension on an unknown host
    assert!(media_url("https://cdn.example.com/a/b.mp4", cdn).is_some());

    // relative, wrong scheme, page urls
    assert!(media_url("/video_redirect/?src=x", cdn).is_none());
    assert!(media_url("javascript:alert(1).mp4", cdn).is_none());
    assert!(media_url("https://www.facebook.com/watch/?v=1", cdn).is_none());
    assert!(media_url("https://notfbcdn.net/v/stream", cdn).is_none());
  }

  #[test]
  fn test_unescape_scraped() {
    assert_eq!(
      unescape_scraped(r"https:\/\/video.fbcdn.net\/v\/a.mp4?a=1&b=2"),
      "https://video.fbcdn.net/v/a.mp4?a=1&b=2"
    );
    assert_eq!(
      unescape_scraped("https://x.fbcdn.net/a.mp4?a=1&amp;b=2"),
      "https://x.fbcdn.net/a.mp4?a=1&b=2"
    );
  }
}
