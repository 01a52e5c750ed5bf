use std::time::Duration;

use async_trait::async_trait;
use http_types::Url;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::Value;

use crate::{error::StrategyError, source::SourceRequest};

use super::{
  Extractor, Http, ResolvedMedia, StrategyId, Variant, VariantKind,
};

const DEFAULT_PIPED_INSTANCE: &str = "pipedapi.kavin.rocks";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipedInstance {
  domain: String,
}

impl PipedInstance {
  pub fn new(domain: impl Into<String>) -> Self {
    Self {
      domain: domain.into(),
    }
  }

  pub fn stream_url(&self, video_id: &str) -> String {
    format!("https://{}/streams/{}", self.domain, video_id)
  }
}

impl Default for PipedInstance {
  fn default() -> Self {
    Self::new(DEFAULT_PIPED_INSTANCE)
  }
}

/// Resolves YouTube videos through the Piped streams API.
#[derive(Clone)]
pub struct Piped {
  http: Http,
  instance: PipedInstance,
}

impl Piped {
  pub fn new(http: Http, instance: PipedInstance) -> Self {
    Self { http, instance }
  }
}

#[async_trait]
impl Extractor for Piped {
  fn id(&self) -> StrategyId {
    StrategyId::StructuredApi
  }

  fn timeout(&self) -> Duration {
    self.http.budget()
  }

  async fn extract(
    &self,
    request: &SourceRequest,
  ) -> Result<ResolvedMedia, StrategyError> {
    let video_id = youtube_video_id(request.url()).ok_or_else(|| {
      StrategyError::Unsupported(format!("no video id in {}", request.url()))
    })?;

    let mut headers = HeaderMap::new();
    headers.insert(header::USER_AGENT, HeaderValue::from_static("Mozilla/5.0"));

    let (title, variants) = self
      .http
      .get_with(
        &self.instance.stream_url(&video_id),
        &headers,
        |status, _, body| parse_streams(status, &body),
      )
      .await?;

    if variants.is_empty() {
      return Err(StrategyError::NoMedia("piped streams"));
    }

    Ok(ResolvedMedia {
      platform: request.platform(),
      title: Some(title),
      variants,
    })
  }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct PipedStream {
  url: String,
  #[serde(default)]
  mime_type: String,
  #[serde(default)]
  video_only: bool,
  #[serde(default)]
  bitrate: Option<u64>,
  #[serde(default)]
  height: Option<u32>,
  // -1 when the instance doesn't know
  #[serde(default)]
  content_length: Option<i64>,
}

impl PipedStream {
  fn into_variant(self, audio: bool) -> Variant {
    let kind = match (audio, self.video_only) {
      (true, _) => VariantKind::AudioOnly,
      (false, true) => VariantKind::VideoOnly,
      (false, false) => VariantKind::Muxed,
    };
    let container = container_of(&self.mime_type, audio);
    let size = self
      .content_length
      .filter(|len| *len > 0)
      .map(|len| len as u64);

    Variant::new(self.url, kind, container)
      .with_height(self.height.filter(|h| *h > 0))
      .with_bitrate(self.bitrate.map(|b| (b / 1000) as u32))
      .with_size(size)
  }
}

fn container_of(mime_type: &str, audio: bool) -> &'static str {
  let subtype = mime_type.split(';').next().unwrap_or_default();
  match (subtype, audio) {
    ("video/webm", _) | ("audio/webm", _) => "webm",
    ("audio/mp4", _) | (_, true) => "m4a",
    _ => "mp4",
  }
}

fn parse_streams(
  status: reqwest::StatusCode,
  body: &str,
) -> Result<(String, Vec<Variant>), StrategyError> {
  use serde_query::{DeserializeQuery, Query};

  #[derive(DeserializeQuery)]
  struct PipedStreamsResp {
    #[query(".title")]
    title: String,
    #[query(".videoStreams")]
    video_streams: Vec<PipedStream>,
    #[query(".audioStreams")]
    audio_streams: Vec<PipedStream>,
  }

  // piped reports extraction failures as a json object with an error field
  if let Ok(value) = serde_json::from_str::<Value>(body) {
    if let Some(err) = api_error(&value) {
      return Err(err);
    }
  }
  if let Some(err) = StrategyError::from_status(status) {
    return Err(err);
  }

  let resp: PipedStreamsResp =
    serde_json::from_str::<Query<PipedStreamsResp>>(body)
      .map_err(|e| StrategyError::Malformed(e.to_string()))?
      .into();

  let variants = resp
    .video_streams
    .into_iter()
    .map(|s| s.into_variant(false))
    .chain(resp.audio_streams.into_iter().map(|s| s.into_variant(true)))
    .collect();

  Ok((resp.title, variants))
}

fn api_error(value: &Value) -> Option<StrategyError> {
  let message = value
    .get("message")
    .or_else(|| value.get("error"))?
    .as_str()?
    .to_string();
  let lower = message.to_ascii_lowercase();

  let err = if lower.contains("private") || lower.contains("sign in") {
    StrategyError::Restricted(message)
  } else if lower.contains("unavailable") || lower.contains("not found") {
    StrategyError::NotFound
  } else {
    StrategyError::Other(message)
  };
  Some(err)
}

static VIDEO_ID_REGEX: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").unwrap());

pub fn youtube_video_id(url: &Url) -> Option<String> {
  let host = url.host_str()?.to_ascii_lowercase();
  let mut segments = url.path_segments()?.filter(|s| !s.is_empty());

  let candidate = if host == "youtu.be" {
    segments.next()?.to_string()
  } else {
    match segments.next()? {
      "watch" => url
        .query_pairs()
        .find(|(key, _)| key == "v")
        .map(|(_, value)| value.into_owned())?,
      "shorts" | "embed" | "live" | "v" => segments.next()?.to_string(),
      _ => return None,
    }
  };

  VIDEO_ID_REGEX.is_match(&candidate).then_some(candidate)
}
