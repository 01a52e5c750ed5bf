use std::{collections::HashMap, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::{process::Command, sync::Semaphore};
use tracing::debug;

use crate::{
  error::StrategyError,
  source::{Platform, SourceRequest},
  util::redact_credentials,
};

use super::{
  Extractor, ResolvedMedia, StrategyId, Variant, VariantKind, ANDROID_UA,
  IPHONE_UA,
};

// run yt-dlp command line to dump the metadata of a single video.
// requires yt-dlp executable to be in PATH.
#[derive(Clone)]
pub struct Ytdlp {
  program: String,
  proxy: Option<String>,
  permits: Arc<Semaphore>,
}

impl Ytdlp {
  pub fn new(proxy: Option<String>, concurrency: usize) -> Self {
    Self {
      program: "yt-dlp".into(),
      proxy,
      permits: Arc::new(Semaphore::new(concurrency.max(1))),
    }
  }

  fn command(&self, request: &SourceRequest) -> Command {
    // tiktok drops connections a lot; give it more room
    let (socket_timeout, retries) = match request.platform() {
      Platform::TikTok => (60, 10),
      _ => (30, 3),
    };

    let mut cmd = Command::new(&self.program);
    cmd
      .args(["-J", "--no-playlist", "--no-warnings"])
      .arg("--socket-timeout")
      .arg(socket_timeout.to_string())
      .arg("--retries")
      .arg(retries.to_string());

    // mobile clients get blocked less often
    let (user_agent, referer) = match request.platform() {
      Platform::TikTok => (Some(ANDROID_UA), Some("https://www.tiktok.com/")),
      Platform::Facebook => {
        (Some(ANDROID_UA), Some("https://www.facebook.com/"))
      }
      Platform::Instagram => (Some(IPHONE_UA), None),
      _ => (None, None),
    };
    if let Some(user_agent) = user_agent {
      cmd.arg("--user-agent").arg(user_agent);
    }
    if let Some(referer) = referer {
      cmd.arg("--add-header").arg(format!("Referer:{referer}"));
    }
    if request.platform() == Platform::YouTube {
      cmd
        .arg("--extractor-args")
        .arg("youtube:player_client=android,web");
    }

    if let Some(proxy) = &self.proxy {
      debug!(proxy = %redact_credentials(proxy), "yt-dlp using proxy");
      cmd.arg("--proxy").arg(proxy);
    }

    cmd
      .arg(request.url().as_str())
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);
    cmd
  }
}

#[async_trait]
impl Extractor for Ytdlp {
  fn id(&self) -> StrategyId {
    StrategyId::Generic
  }

  fn timeout(&self) -> Duration {
    Duration::from_secs(120)
  }

  async fn extract(
    &self,
    request: &SourceRequest,
  ) -> Result<ResolvedMedia, StrategyError> {
    let _permit = self
      .permits
      .acquire()
      .await
      .map_err(|e| StrategyError::Unavailable(e.to_string()))?;

    let output = self.command(request).output().await.map_err(|e| {
      match e.kind() {
        std::io::ErrorKind::NotFound => {
          StrategyError::Unavailable(format!("{} not found", self.program))
        }
        _ => StrategyError::Other(e.to_string()),
      }
    })?;

    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr);
      return Err(classify_stderr(&stderr));
    }

    let (title, variants) = parse_output(&output.stdout)?;
    Ok(ResolvedMedia {
      platform: request.platform(),
      title,
      variants,
    })
  }
}

#[derive(Deserialize, Debug)]
struct YtdlpOutput {
  title: Option<String>,
  url: Option<String>,
  ext: Option<String>,
  #[serde(default)]
  formats: Vec<Format>,
  #[serde(default)]
  http_headers: HashMap<String, String>,
}

#[derive(Deserialize, Debug)]
struct Format {
  url: Option<String>,
  ext: Option<String>,
  protocol: Option<String>,
  vcodec: Option<String>,
  acodec: Option<String>,
  height: Option<u32>,
  filesize: Option<f64>,
  filesize_approx: Option<f64>,
  abr: Option<f64>,
  tbr: Option<f64>,
  #[serde(default)]
  http_headers: HashMap<String, String>,
}

impl Format {
  // only plain downloads; manifests and fragmented protocols are skipped
  fn into_variant(self) -> Option<Variant> {
    let protocol = self.protocol.as_deref().unwrap_or("https");
    if !matches!(protocol, "http" | "https") {
      return None;
    }

    let has = |codec: &Option<String>| {
      codec.as_deref().map_or(true, |c| c != "none")
    };
    let kind = match (has(&self.vcodec), has(&self.acodec)) {
      (true, true) => VariantKind::Muxed,
      (true, false) => VariantKind::VideoOnly,
      (false, true) => VariantKind::AudioOnly,
      (false, false) => return None,
    };

    let size = self
      .filesize
      .or(self.filesize_approx)
      .filter(|s| *s > 0.0)
      .map(|s| s as u64);
    let bitrate = self.abr.or(self.tbr).map(|b| b.round() as u32);

    Some(
      Variant::new(self.url?, kind, self.ext.unwrap_or_else(|| "mp4".into()))
        .with_height(self.height)
        .with_bitrate(bitrate)
        .with_size(size)
        .with_headers(self.http_headers.into_iter().collect()),
    )
  }
}

fn parse_output(
  stdout: &[u8],
) -> Result<(Option<String>, Vec<Variant>), StrategyError> {
  let output: YtdlpOutput = serde_json::from_slice(stdout)
    .map_err(|e| StrategyError::Malformed(e.to_string()))?;

  let mut variants: Vec<Variant> = output
    .formats
    .into_iter()
    .filter_map(Format::into_variant)
    .collect();

  // single-format extractors only fill in the top level url
  if variants.is_empty() {
    if let Some(url) = output.url {
      let ext = output.ext.unwrap_or_else(|| "mp4".into());
      variants.push(
        Variant::new(url, VariantKind::Muxed, ext)
          .with_headers(output.http_headers.into_iter().collect()),
      );
    }
  }

  if variants.is_empty() {
    return Err(StrategyError::NoMedia("yt-dlp output"));
  }

  Ok((output.title, variants))
}

pub fn classify_stderr(stderr: &str) -> StrategyError {
  let message = stderr
    .lines()
    .rev()
    .find(|line| line.contains("ERROR"))
    .unwrap_or_else(|| stderr.trim())
    .trim()
    .to_string();
  let lower = message.to_ascii_lowercase();
  let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

  if has(&["unsupported url"]) {
    StrategyError::Unsupported(message)
  } else if has(&["not a bot", "unusual traffic"]) {
    // an anti-bot wall in front of the server, not a trait of the media
    StrategyError::RateLimited
  } else if has(&[
    "private",
    "sign in",
    "login",
    "log in",
    "age-restricted",
    "confirm your age",
    "inappropriate",
    "country",
  ]) {
    StrategyError::Restricted(message)
  } else if has(&["404", "not found", "does not exist"]) {
    StrategyError::NotFound
  } else if has(&["timed out", "timeout"]) {
    StrategyError::Timeout
  } else if has(&["429", "too many requests"]) {
    StrategyError::RateLimited
  } else if let Some(code) = server_error(&lower) {
    StrategyError::Upstream(code)
  } else if has(&[
    "connection reset",
    "connection aborted",
    "connection refused",
    "10054",
  ]) {
    StrategyError::Connection(message)
  } else {
    StrategyError::Other(message)
  }
}

fn server_error(lower: &str) -> Option<u16> {
  let (_, rest) = lower.split_once("http error ")?;
  let code: u16 = rest.get(..3)?.parse().ok()?;
  (500..600).contains(&code).then_some(code)
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::retry::Retriable;

  #[test]
  fn test_parse_formats() {
    let stdout = br#"{
      "title": "Clip",
      "formats": [
        {"url": "https://m/manifest.m3u8", "ext": "mp4", "protocol": "m3u8_native",
         "vcodec": "avc1", "acodec": "mp4a", "height": 720},
        {"url": "https://m/a.m4a", "ext": "m4a", "protocol": "https",
         "vcodec": "none", "acodec": "mp4a.40.2", "abr": 129.5, "filesize": 3000000},
        {"url": "https://m/v.mp4", "ext": "mp4", "protocol": "https",
         "vcodec": "avc1", "acodec": "mp4a", "height": 1080, "tbr": 2500,
         "filesize_approx": 52428800.0, "http_headers": {"Referer": "https://x"}}
      ]
    }"#;

    let (title, variants) = parse_output(stdout).unwrap();
    assert_eq!(title.as_deref(), Some("Clip"));
    assert_eq!(variants.len(), 2);

    assert_eq!(variants[0].kind, VariantKind::AudioOnly);
    assert_eq!(variants[0].bitrate_kbps, Some(130));
    assert_eq!(variants[0].size, Some(3_000_000));

    assert_eq!(variants[1].kind, VariantKind::Muxed);
    assert_eq!(variants[1].height, Some(1080));
    assert_eq!(variants[1].size, Some(52_428_800));
    assert_eq!(
      variants[1].headers,
      vec![("Referer".to_string(), "https://x".to_string())]
    );
  }

  #[test]
  fn test_top_level_url_fallback() {
    let stdout = br#"{"title": null, "url": "https://cdn/x.mp4", "ext": "mp4"}"#;
    let (_, variants) = parse_output(stdout).unwrap();
    assert_eq!(variants.len(), 1);
    assert_eq!(variants[0].url, "https://cdn/x.mp4");

    assert_eq!(
      parse_output(br#"{"formats": []}"#),
      Err(StrategyError::NoMedia("yt-dlp output"))
    );
  }

  #[test]
  fn test_classify_stderr() {
    assert!(matches!(
      classify_stderr("ERROR: Unsupported URL: https://example.com"),
      StrategyError::Unsupported(_)
    ));
    assert!(matches!(
      classify_stderr("ERROR: [instagram] abc: This video is private"),
      StrategyError::Restricted(_)
    ));
    assert_eq!(
      classify_stderr("ERROR: Unable to download webpage: HTTP Error 404"),
      StrategyError::NotFound
    );
    assert_eq!(
      classify_stderr("ERROR: Unable to download: HTTP Error 503: Unavailable"),
      StrategyError::Upstream(503)
    );
    assert_eq!(
      classify_stderr("ERROR: HTTP Error 429: Too Many Requests"),
      StrategyError::RateLimited
    );
    assert!(matches!(
      classify_stderr("ERROR: [WinError 10054] connection forcibly closed"),
      StrategyError::Connection(_)
    ));
    assert_eq!(
      classify_stderr("ERROR: Sign in to confirm your age"),
      StrategyError::Restricted("ERROR: Sign in to confirm your age".into())
    );
    assert_eq!(
      classify_stderr("ERROR: read timed out"),
      StrategyError::Timeout
    );
  }

  #[test]
  fn test_bot_check_is_not_a_restriction() {
    let stderr = "WARNING: [youtube] cookies are missing\n\
      ERROR: [youtube] dQw4w9WgXcQ: Sign in to confirm you’re not a bot. \
      Use --cookies-from-browser or --cookies for the authentication.";
    let err = classify_stderr(stderr);
    assert_eq!(err, StrategyError::RateLimited);
    assert!(err.is_retriable());

    // a real login wall still ends the chain
    assert!(matches!(
      classify_stderr("ERROR: [youtube] abc: Sign in to confirm your age"),
      StrategyError::Restricted(_)
    ));
  }
}
