use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, info_span, Instrument};

use crate::{
  delivery::{
    DeliveryOutcome, Executor, Recipient, TelegramUploader, Uploader,
  },
  error::Result,
  extractor::{Extractor, Strategy},
  fetch::Fetcher,
  resolver::{ExtractionAttempt, Resolver},
  selector::{Downgrade, Selector},
  source::{Platform, SourceRequest},
  storage::Storage,
  transport::{self, Capabilities},
  util::serialize_millis,
};

/// What happened to one request, from resolution to delivery.
#[derive(Debug, Serialize)]
pub struct Report {
  pub platform: Platform,
  pub attempts: Vec<ExtractionAttempt>,
  pub downgrade: Option<Downgrade>,
  pub native_format_fallback: bool,
  pub format: String,
  pub size: u64,
  pub outcome: DeliveryOutcome,
  #[serde(serialize_with = "serialize_millis")]
  pub elapsed: Duration,
}

/// Resolve, select, fetch and deliver, for one request at a time. Requests
/// share nothing but the storage budget and the yt-dlp permits.
pub struct Pipeline<E = Strategy, U = TelegramUploader> {
  pub resolver: Resolver<E>,
  pub selector: Selector,
  pub fetcher: Fetcher,
  pub storage: Storage,
  pub executor: Executor<U>,
  pub capabilities: Capabilities,
}

impl<E: Extractor, U: Uploader> Pipeline<E, U> {
  pub async fn run(
    &self,
    request: SourceRequest,
    recipient: Recipient,
  ) -> Result<Report> {
    let span = info_span!(
      "request",
      platform = %request.platform(),
      profile = %request.profile(),
      chat = recipient.chat_id,
    );
    self.run_inner(request, recipient).instrument(span).await
  }

  async fn run_inner(
    &self,
    request: SourceRequest,
    recipient: Recipient,
  ) -> Result<Report> {
    let started = Instant::now();
    let resolution = self.resolver.resolve(&request).await?;
    let selection = self
      .selector
      .select(&resolution.media, request.profile())?;

    // the declared size is final unless the payload gets transcoded
    let declared = selection.declared_size();
    if let (Some(size), None) = (declared, selection.conversion) {
      transport::choose(size, self.capabilities)?;
    }

    let artifact = self.fetcher.fetch(&selection, &self.storage).await?;
    let transport = transport::choose(artifact.size(), self.capabilities)?;
    let outcome = self
      .executor
      .deliver(&artifact, transport, &recipient)
      .await;

    let report = Report {
      platform: request.platform(),
      attempts: resolution.attempts,
      downgrade: selection.downgrade,
      native_format_fallback: artifact.native_fallback,
      format: artifact.format.clone(),
      size: artifact.size(),
      outcome,
      elapsed: started.elapsed(),
    };
    drop(artifact);

    info!(
      success = report.outcome.success,
      size = report.size,
      elapsed = ?report.elapsed,
      "request finished"
    );
    Ok(report)
  }
}
