mod telegram;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
  error::DeliveryError,
  fetch::{Artifact, ArtifactKind},
  retry::{Retriable, RetryPolicy},
  transport::Transport,
  util::serialize_display_opt,
};

pub use telegram::TelegramUploader;

/// How the payload is presented to the recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
  Video,
  Audio,
  /// Generic file; accepted for anything the typed containers refuse.
  Document,
}

impl Container {
  pub fn primary(kind: ArtifactKind) -> Self {
    match kind {
      ArtifactKind::Video => Container::Video,
      ArtifactKind::Audio => Container::Audio,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
  pub chat_id: i64,
  pub caption: Option<String>,
}

#[async_trait]
pub trait Uploader: Send + Sync {
  async fn upload(
    &self,
    transport: Transport,
    container: Container,
    artifact: &Artifact,
    recipient: &Recipient,
  ) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryOutcome {
  pub transport: Transport,
  /// Container of the last attempt.
  pub container: Container,
  pub attempts: u32,
  pub success: bool,
  #[serde(serialize_with = "serialize_display_opt")]
  pub error: Option<DeliveryError>,
}

impl DeliveryOutcome {
  pub fn code(&self) -> Option<&'static str> {
    self.error.as_ref().map(DeliveryError::code)
  }
}

pub struct Executor<U = TelegramUploader> {
  uploader: U,
  retry: RetryPolicy,
  attempt_timeout: Duration,
}

impl<U: Uploader> Executor<U> {
  pub fn new(
    uploader: U,
    retry: RetryPolicy,
    attempt_timeout: Duration,
  ) -> Self {
    Self {
      uploader,
      retry,
      attempt_timeout,
    }
  }

  pub fn uploader(&self) -> &U {
    &self.uploader
  }

  /// Uploads the artifact in its primary container with bounded retries,
  /// then once more as a document if only transient errors were seen.
  pub async fn deliver(
    &self,
    artifact: &Artifact,
    transport: Transport,
    recipient: &Recipient,
  ) -> DeliveryOutcome {
    let primary = Container::primary(artifact.kind);

    let retried = self
      .retry
      .run(|attempt| async move {
        info!(attempt, %transport, container = ?primary, "uploading");
        self.attempt(transport, primary, artifact, recipient).await
      })
      .await;

    let mut attempts = retried.attempts;
    let (container, result) = match retried.result {
      Err(err) if err.is_retriable() => {
        warn!(
          attempts,
          %transport,
          error = %err,
          "retries exhausted, sending as document"
        );
        attempts += 1;
        let result = self
          .attempt(transport, Container::Document, artifact, recipient)
          .await;
        (Container::Document, result)
      }
      result => (primary, result),
    };

    match &result {
      Ok(()) => info!(attempts, %transport, ?container, "delivered"),
      Err(err) => warn!(attempts, %transport, error = %err, "delivery failed"),
    }

    DeliveryOutcome {
      transport,
      container,
      attempts,
      success: result.is_ok(),
      error: result.err(),
    }
  }

  async fn attempt(
    &self,
    transport: Transport,
    container: Container,
    artifact: &Artifact,
    recipient: &Recipient,
  ) -> Result<(), DeliveryError> {
    let upload = self
      .uploader
      .upload(transport, container, artifact, recipient);
    tokio::time::timeout(self.attempt_timeout, upload)
      .await
      .unwrap_or(Err(DeliveryError::Timeout))
  }
}
