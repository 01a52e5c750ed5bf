use std::{fmt::Display, future::Future, time::Duration};

use rand::Rng;
use tracing::debug;

pub trait Retriable {
  fn is_retriable(&self) -> bool;

  /// Minimum delay the remote side asked for before trying again.
  fn retry_after(&self) -> Option<Duration> {
    None
  }
}

/// Bounded retry with exponential backoff.
///
/// Only errors that report themselves as retriable are retried; anything
/// else is returned right away. Sleeps go through `tokio::time::sleep`, so
/// only the calling task is suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

pub struct Retried<T, E> {
  pub result: Result<T, E>,
  pub attempts: u32,
}

impl RetryPolicy {
  pub const fn new(max_attempts: u32, base_delay: Duration) -> Self {
    Self {
      max_attempts,
      base_delay,
      max_delay: Duration::from_secs(30),
    }
  }

  pub const fn with_max_delay(self, max_delay: Duration) -> Self {
    Self { max_delay, ..self }
  }

  /// Delay after the given (1-based) attempt failed, before jitter.
  pub fn backoff(&self, attempt: u32) -> Duration {
    let factor = 1u32
      .checked_shl(attempt.saturating_sub(1))
      .unwrap_or(u32::MAX);
    self.base_delay.saturating_mul(factor).min(self.max_delay)
  }

  /// Longest `run` can take when every attempt uses up `per_attempt` and
  /// the remote side never asks for a longer pause.
  pub fn worst_case(&self, per_attempt: Duration) -> Duration {
    let attempts = self.max_attempts.max(1);
    let backoff: Duration = (1..attempts).map(|a| self.backoff(a)).sum();
    per_attempt * attempts + backoff + backoff / 10
  }

  // up to 10% extra, so concurrent requests don't retry in lockstep
  fn jittered(&self, attempt: u32) -> Duration {
    let delay = self.backoff(attempt);
    let spread = delay.as_millis() as u64 / 10;
    if spread == 0 {
      return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
  }

  pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Retried<T, E>
  where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retriable + Display,
  {
    let max_attempts = self.max_attempts.max(1);
    let mut attempt = 1;

    loop {
      match op(attempt).await {
        Ok(value) => {
          return Retried {
            result: Ok(value),
            attempts: attempt,
          }
        }
        Err(err) if attempt < max_attempts && err.is_retriable() => {
          let delay = self
            .jittered(attempt)
            .max(err.retry_after().unwrap_or_default());
          debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying after transient error"
          );
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(err) => {
          return Retried {
            result: Err(err),
            attempts: attempt,
          }
        }
      }
    }
  }
}
