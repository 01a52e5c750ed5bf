use std::time::Duration;

use serde::{ser::SerializeStruct, Serialize, Serializer};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::{
  config::Config,
  error::{ResolutionError, ResolutionKind, StrategyError},
  extractor::{
    EmbeddedJson, Extractor, Http, MobileScrape, PatternScan, Piped,
    PipedInstance, ResolvedMedia, Strategy, StrategyId, Ytdlp,
  },
  source::{Platform, SourceRequest},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
  Success,
  Failure(StrategyError),
}

/// Record of one strategy invocation. Created once the invocation ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionAttempt {
  pub strategy: StrategyId,
  pub outcome: AttemptOutcome,
  pub elapsed: Duration,
}

impl ExtractionAttempt {
  pub fn succeeded(&self) -> bool {
    self.outcome == AttemptOutcome::Success
  }
}

impl Serialize for ExtractionAttempt {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let mut s = serializer.serialize_struct("ExtractionAttempt", 4)?;
    s.serialize_field("strategy", &self.strategy)?;
    s.serialize_field("success", &self.succeeded())?;
    let error = match &self.outcome {
      AttemptOutcome::Success => None,
      AttemptOutcome::Failure(err) => Some(err.to_string()),
    };
    s.serialize_field("error", &error)?;
    s.serialize_field("elapsed_ms", &(self.elapsed.as_millis() as u64))?;
    s.end()
  }
}

#[derive(Debug)]
pub struct Resolution {
  pub media: ResolvedMedia,
  pub attempts: Vec<ExtractionAttempt>,
}

/// Maps each platform to an ordered chain of extraction strategies and
/// walks the chain until one of them yields media.
pub struct Resolver<E = Strategy> {
  chains: Vec<(Platform, Vec<E>)>,
  default_chain: Vec<E>,
}

impl<E> Default for Resolver<E> {
  fn default() -> Self {
    Self {
      chains: vec![],
      default_chain: vec![],
    }
  }
}

impl<E: Extractor> Resolver<E> {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_chain(mut self, platform: Platform, chain: Vec<E>) -> Self {
    self.chains.retain(|(p, _)| *p != platform);
    self.chains.push((platform, chain));
    self
  }

  /// Chain for platforms without a dedicated one.
  pub fn with_default_chain(mut self, chain: Vec<E>) -> Self {
    self.default_chain = chain;
    self
  }

  pub fn chain(&self, platform: Platform) -> &[E] {
    self
      .chains
      .iter()
      .find(|(p, _)| *p == platform)
      .map(|(_, chain)| chain.as_slice())
      .unwrap_or(self.default_chain.as_slice())
  }

  pub async fn resolve(
    &self,
    request: &SourceRequest,
  ) -> Result<Resolution, ResolutionError> {
    let platform = request.platform();
    let chain = self.chain(platform);
    if chain.is_empty() {
      return Err(ResolutionError::new(
        ResolutionKind::UnsupportedPlatform,
        vec![],
      ));
    }

    let mut attempts = Vec::with_capacity(chain.len());

    for strategy in chain {
      let id = strategy.id();
      let started = Instant::now();
      let deadline = strategy.timeout();
      let result =
        match tokio::time::timeout(deadline, strategy.extract(request)).await {
          Ok(result) => result,
          Err(_) => Err(StrategyError::Timeout),
        };
      let elapsed = started.elapsed();

      match result {
        Ok(media) => {
          info!(%platform, strategy = %id, ?elapsed, "extraction succeeded");
          attempts.push(ExtractionAttempt {
            strategy: id,
            outcome: AttemptOutcome::Success,
            elapsed,
          });
          return Ok(Resolution { media, attempts });
        }
        Err(err) => {
          warn!(
            %platform,
            strategy = %id,
            ?elapsed,
            error = %err,
            "extraction failed"
          );
          let restricted = matches!(err, StrategyError::Restricted(_));
          attempts.push(ExtractionAttempt {
            strategy: id,
            outcome: AttemptOutcome::Failure(err),
            elapsed,
          });

          // the content itself is off limits; other methods won't help
          if restricted {
            return Err(ResolutionError::new(
              ResolutionKind::ContentRestricted,
              attempts,
            ));
          }
        }
      }
    }

    let unsupported = attempts.iter().all(|attempt| {
      matches!(
        attempt.outcome,
        AttemptOutcome::Failure(StrategyError::Unsupported(_))
      )
    });
    let kind = if unsupported {
      ResolutionKind::UnsupportedPlatform
    } else {
      ResolutionKind::AllStrategiesFailed
    };

    Err(ResolutionError::new(kind, attempts))
  }
}

impl Resolver<Strategy> {
  pub fn from_config(config: &Config, http: Http) -> Self {
    let ytdlp = Strategy::Generic(Ytdlp::new(
      config.ytdlp_proxy.clone(),
      config.ytdlp_concurrency,
    ));
    let piped = Strategy::StructuredApi(Piped::new(
      http.clone(),
      PipedInstance::new(config.piped_instance.clone()),
    ));

    Self::new()
      .with_chain(Platform::YouTube, vec![piped, ytdlp.clone()])
      .with_chain(
        Platform::Facebook,
        vec![
          Strategy::MobileScrape(MobileScrape::new(http.clone())),
          Strategy::PatternScan(PatternScan::new(http.clone())),
          Strategy::EmbeddedJson(EmbeddedJson::new(http)),
          ytdlp.clone(),
        ],
      )
      .with_default_chain(vec![ytdlp])
  }
}
