use std::time::Duration;

use axum::{
  response::{IntoResponse, Response},
  Json,
};
use reqwest::StatusCode;
use serde_json::json;
use thiserror::Error;

use crate::{
  resolver::ExtractionAttempt, retry::Retriable, transport::Transport,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure of a single extraction strategy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StrategyError {
  #[error("timed out")]
  Timeout,
  #[error("upstream server error {0}")]
  Upstream(u16),
  #[error("rate limited by upstream")]
  RateLimited,
  #[error("connection failed: {0}")]
  Connection(String),
  #[error("content not found")]
  NotFound,
  #[error("content is restricted: {0}")]
  Restricted(String),
  #[error("unsupported url: {0}")]
  Unsupported(String),
  #[error("unexpected status {0}")]
  Status(u16),
  #[error("no media found in {0}")]
  NoMedia(&'static str),
  #[error("malformed response: {0}")]
  Malformed(String),
  #[error("extractor unavailable: {0}")]
  Unavailable(String),
  #[error("{0}")]
  Other(String),
}

impl StrategyError {
  /// Maps a non-success HTTP status to an error. Returns `None` for 2xx/3xx.
  pub fn from_status(status: StatusCode) -> Option<Self> {
    if !(status.is_client_error() || status.is_server_error()) {
      return None;
    }

    let err = match status.as_u16() {
      404 | 410 => Self::NotFound,
      401 => Self::Restricted("authentication required".into()),
      429 => Self::RateLimited,
      code @ 500..=599 => Self::Upstream(code),
      code => Self::Status(code),
    };
    Some(err)
  }
}

impl Retriable for StrategyError {
  fn is_retriable(&self) -> bool {
    matches!(
      self,
      Self::Timeout
        | Self::Upstream(_)
        | Self::RateLimited
        | Self::Connection(_)
    )
  }
}

impl From<reqwest::Error> for StrategyError {
  fn from(err: reqwest::Error) -> Self {
    if err.is_timeout() {
      return Self::Timeout;
    }

    if let Some(err) = err.status().and_then(Self::from_status) {
      return err;
    }

    if err.is_decode() || err.is_body() {
      return Self::Malformed(err.without_url().to_string());
    }

    Self::Connection(err.without_url().to_string())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionKind {
  UnsupportedPlatform,
  ContentRestricted,
  AllStrategiesFailed,
}

impl ResolutionKind {
  pub fn code(&self) -> &'static str {
    match self {
      Self::UnsupportedPlatform => "unsupported-platform",
      Self::ContentRestricted => "content-restricted",
      Self::AllStrategiesFailed => "all-strategies-failed",
    }
  }
}

impl std::fmt::Display for ResolutionKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.code())
  }
}

/// Every strategy for the request failed. Carries the full attempt log.
#[derive(Debug, Clone, Error)]
#[error("{kind} after {} attempt(s)", .attempts.len())]
pub struct ResolutionError {
  pub kind: ResolutionKind,
  pub attempts: Vec<ExtractionAttempt>,
}

impl ResolutionError {
  pub fn new(kind: ResolutionKind, attempts: Vec<ExtractionAttempt>) -> Self {
    Self { kind, attempts }
  }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectionError {
  #[error("resolved media has no usable variant")]
  NoUsableVariant,
  #[error("artifact of {size} bytes needs a transport above {ceiling} bytes")]
  CapacityExceeded { size: u64, ceiling: u64 },
}

impl SelectionError {
  pub fn code(&self) -> &'static str {
    match self {
      Self::NoUsableVariant => "no-usable-variant",
      Self::CapacityExceeded { .. } => "capacity-exceeded",
    }
  }
}

#[derive(Debug, Error)]
pub enum StorageError {
  #[error(
    "temporary storage full: {requested} bytes requested, {available} available"
  )]
  Full { requested: u64, available: u64 },
  #[error(transparent)]
  IO(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConvertError {
  #[error("failed to run converter: {0}")]
  Spawn(#[from] std::io::Error),
  #[error("converter exited with {status}: {stderr}")]
  Failed { status: String, stderr: String },
  #[error("no converter available")]
  Unavailable,
}

#[derive(Debug, Error)]
pub enum FetchError {
  #[error("download failed: {0}")]
  Http(StrategyError),
  #[error(transparent)]
  Storage(#[from] StorageError),
  #[error("failed to merge video and audio: {0}")]
  Merge(ConvertError),
}

/// Failure of one upload attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
  #[error("upload timed out")]
  Timeout,
  #[error("network error: {0}")]
  Network(String),
  #[error("rate limited, retry after {0:?}")]
  RateLimited(Duration),
  #[error("transport server error {0}")]
  Upstream(u16),
  #[error("transport rejected credentials: {0}")]
  Unauthorized(String),
  #[error("payload rejected: {0}")]
  Rejected(String),
  #[error("payload too large for the {0} transport")]
  TooLarge(Transport),
  #[error("the {0} transport is not available")]
  Unavailable(Transport),
  #[error("cannot read artifact: {0}")]
  IO(String),
}

impl DeliveryError {
  pub fn code(&self) -> &'static str {
    match self {
      Self::TooLarge(_) => "capacity-exceeded",
      Self::Unauthorized(_) => "delivery-unauthorized",
      Self::Rejected(_) => "delivery-rejected",
      _ => "delivery-failed",
    }
  }
}

impl Retriable for DeliveryError {
  fn is_retriable(&self) -> bool {
    matches!(
      self,
      Self::Timeout
        | Self::Network(_)
        | Self::RateLimited(_)
        | Self::Upstream(_)
    )
  }

  fn retry_after(&self) -> Option<Duration> {
    match self {
      Self::RateLimited(delay) => Some(*delay),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
  #[error("invalid url {0:?}")]
  InvalidUrl(String),
  #[error("unsupported url scheme {0:?}")]
  Scheme(String),
  #[error("refusing to fetch from host {0:?}")]
  BlockedHost(String),
  #[error("unknown profile {0:?}")]
  Profile(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("missing environment variable {0}")]
  Missing(&'static str),
  #[error("invalid value for {name}: {value:?}")]
  Invalid { name: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Request(#[from] RequestError),
  #[error(transparent)]
  Resolution(#[from] ResolutionError),
  #[error(transparent)]
  Selection(#[from] SelectionError),
  #[error(transparent)]
  Fetch(#[from] FetchError),
}

impl Error {
  /// Classification code the messaging layer maps to user-facing text.
  pub fn code(&self) -> &'static str {
    match self {
      Error::Request(_) => "invalid-request",
      Error::Resolution(err) => err.kind.code(),
      Error::Selection(err) => err.code(),
      Error::Fetch(FetchError::Storage(StorageError::Full { .. })) => {
        "storage-exhausted"
      }
      Error::Fetch(_) => "fetch-failed",
    }
  }

  fn status(&self) -> StatusCode {
    match self {
      Error::Request(_) => StatusCode::BAD_REQUEST,
      Error::Resolution(err) => match err.kind {
        ResolutionKind::UnsupportedPlatform => StatusCode::UNPROCESSABLE_ENTITY,
        ResolutionKind::ContentRestricted => StatusCode::FORBIDDEN,
        ResolutionKind::AllStrategiesFailed => StatusCode::SERVICE_UNAVAILABLE,
      },
      Error::Selection(SelectionError::NoUsableVariant) => {
        StatusCode::UNPROCESSABLE_ENTITY
      }
      Error::Selection(SelectionError::CapacityExceeded { .. }) => {
        StatusCode::PAYLOAD_TOO_LARGE
      }
      Error::Fetch(FetchError::Storage(StorageError::Full { .. })) => {
        StatusCode::INSUFFICIENT_STORAGE
      }
      Error::Fetch(_) => StatusCode::BAD_GATEWAY,
    }
  }
}

impl IntoResponse for Error {
  fn into_response(self) -> Response {
    let body = Json(json!({
      "code": self.code(),
      "message": self.to_string(),
    }));
    (self.status(), body).into_response()
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn test_status_mapping() {
    assert_eq!(StrategyError::from_status(StatusCode::OK), None);
    assert_eq!(
      StrategyError::from_status(StatusCode::NOT_FOUND),
      Some(StrategyError::NotFound)
    );
    assert_eq!(
      StrategyError::from_status(StatusCode::BAD_GATEWAY),
      Some(StrategyError::Upstream(502))
    );
    assert!(matches!(
      StrategyError::from_status(StatusCode::UNAUTHORIZED),
      Some(StrategyError::Restricted(_))
    ));
  }

  #[test]
  fn test_retriable_classes() {
    assert!(StrategyError::Timeout.is_retriable());
    assert!(StrategyError::Upstream(503).is_retriable());
    assert!(!StrategyError::NotFound.is_retriable());
    assert!(!StrategyError::Restricted("private".into()).is_retriable());

    assert!(DeliveryError::Network("reset".into()).is_retriable());
    assert!(!DeliveryError::Unauthorized("bad token".into()).is_retriable());
    assert_eq!(
      DeliveryError::RateLimited(Duration::from_secs(7)).retry_after(),
      Some(Duration::from_secs(7))
    );
  }

  #[test]
  fn test_error_codes() {
    let err = Error::from(ResolutionError::new(
      ResolutionKind::ContentRestricted,
      vec![],
    ));
    assert_eq!(err.code(), "content-restricted");
    assert_eq!(err.status(), StatusCode::FORBIDDEN);

    let err = Error::from(SelectionError::CapacityExceeded {
      size: 10,
      ceiling: 5,
    });
    assert_eq!(err.code(), "capacity-exceeded");

    let err = Error::from(FetchError::Storage(StorageError::Full {
      requested: 10,
      available: 0,
    }));
    assert_eq!(err.code(), "storage-exhausted");
  }
}
