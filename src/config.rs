use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use http_types::Url;

use crate::error::ConfigError;

const DEFAULT_TELEGRAM_API: &str = "https://api.telegram.org/";
const DEFAULT_PIPED_INSTANCE: &str = "pipedapi.kavin.rocks";

/// Process configuration, read once from the environment at startup.
pub struct Config {
  pub bot_token: String,
  pub listen_addr: SocketAddr,
  pub download_dir: PathBuf,
  pub storage_capacity: u64,
  pub piped_instance: String,
  pub ytdlp_proxy: Option<String>,
  pub ytdlp_concurrency: usize,
  pub telegram_api: Url,
  pub local_bot_api: Option<Url>,
  pub api_id: Option<String>,
  pub api_hash: Option<String>,
  pub delivery_attempts: u32,
  pub delivery_timeout: Duration,
}

impl Config {
  pub fn from_env() -> Result<Self, ConfigError> {
    Self::from_lookup(|name| std::env::var(name).ok())
  }

  fn from_lookup(
    lookup: impl Fn(&str) -> Option<String>,
  ) -> Result<Self, ConfigError> {
    let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    let bot_token =
      var("BOT_TOKEN").ok_or(ConfigError::Missing("BOT_TOKEN"))?;
    let storage_mb: u64 = parse(&var, "STORAGE_CAPACITY_MB", 4096)?;
    let storage_capacity = storage_mb.checked_mul(1024 * 1024).ok_or_else(
      || ConfigError::Invalid {
        name: "STORAGE_CAPACITY_MB",
        value: storage_mb.to_string(),
      },
    )?;
    let timeout_secs: u64 = parse(&var, "DELIVERY_TIMEOUT_SECS", 120)?;

    let telegram_api = api_base(
      "TELEGRAM_API_URL",
      &var("TELEGRAM_API_URL").unwrap_or_else(|| DEFAULT_TELEGRAM_API.into()),
    )?;
    let local_bot_api = var("LOCAL_BOT_API_URL")
      .map(|raw| api_base("LOCAL_BOT_API_URL", &raw))
      .transpose()?;

    Ok(Self {
      bot_token,
      listen_addr: parse(&var, "LISTEN_ADDR", ([0, 0, 0, 0], 8080).into())?,
      download_dir: var("DOWNLOAD_DIR")
        .unwrap_or_else(|| "downloads".into())
        .into(),
      storage_capacity,
      piped_instance: var("PIPED_INSTANCE")
        .unwrap_or_else(|| DEFAULT_PIPED_INSTANCE.into()),
      ytdlp_proxy: var("YTDLP_PROXY"),
      ytdlp_concurrency: parse(&var, "YTDLP_CONCURRENCY", 1)?,
      telegram_api,
      local_bot_api,
      api_id: var("TELEGRAM_API_ID"),
      api_hash: var("TELEGRAM_API_HASH"),
      delivery_attempts: parse(&var, "DELIVERY_ATTEMPTS", 3)?,
      delivery_timeout: Duration::from_secs(timeout_secs),
    })
  }

  /// Base URL of the high-capacity transport. Only set when the server and
  /// the API credentials it runs with are all configured.
  pub fn capable_api(&self) -> Option<&Url> {
    match (&self.local_bot_api, &self.api_id, &self.api_hash) {
      (Some(url), Some(_), Some(_)) => Some(url),
      _ => None,
    }
  }
}

fn parse<T: FromStr>(
  var: impl Fn(&str) -> Option<String>,
  name: &'static str,
  default: T,
) -> Result<T, ConfigError> {
  match var(name) {
    None => Ok(default),
    Some(value) => value
      .trim()
      .parse()
      .map_err(|_| ConfigError::Invalid { name, value }),
  }
}

// `Url::join` drops the last path segment unless the base ends with '/'
fn api_base(name: &'static str, raw: &str) -> Result<Url, ConfigError> {
  let mut raw = raw.trim().to_string();
  if !raw.ends_with('/') {
    raw.push('/');
  }
  raw.parse().map_err(|_| ConfigError::Invalid { name, value: raw })
}

#[cfg(test)]
mod test {
  use std::collections::HashMap;

  use super::*;

  fn config_from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
    let vars: HashMap<String, String> = vars
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect();
    Config::from_lookup(|name| vars.get(name).cloned())
  }

  #[test]
  fn test_defaults() {
    let config = config_from(&[("BOT_TOKEN", "123:abc")]).unwrap();

    assert_eq!(config.storage_capacity, 4096 * 1024 * 1024);
    assert_eq!(config.ytdlp_concurrency, 1);
    assert_eq!(config.delivery_attempts, 3);
    assert_eq!(config.delivery_timeout, Duration::from_secs(120));
    assert_eq!(config.telegram_api.as_str(), "https://api.telegram.org/");
    assert_eq!(config.piped_instance, "pipedapi.kavin.rocks");
    assert!(config.capable_api().is_none());
  }

  #[test]
  fn test_missing_token() {
    assert!(matches!(
      config_from(&[]),
      Err(ConfigError::Missing("BOT_TOKEN"))
    ));
  }

  #[test]
  fn test_invalid_number() {
    let err = config_from(&[("BOT_TOKEN", "t"), ("DELIVERY_ATTEMPTS", "x")]);
    assert!(matches!(
      err,
      Err(ConfigError::Invalid {
        name: "DELIVERY_ATTEMPTS",
        ..
      })
    ));
  }

  #[test]
  fn test_storage_capacity_overflow() {
    let err = config_from(&[
      ("BOT_TOKEN", "t"),
      ("STORAGE_CAPACITY_MB", "18446744073709551615"),
    ]);
    assert!(matches!(
      err,
      Err(ConfigError::Invalid {
        name: "STORAGE_CAPACITY_MB",
        ..
      })
    ));

    let config =
      config_from(&[("BOT_TOKEN", "t"), ("STORAGE_CAPACITY_MB", "10")])
        .unwrap();
    assert_eq!(config.storage_capacity, 10 * 1024 * 1024);
  }

  #[test]
  fn test_capable_requires_credentials() {
    let config = config_from(&[
      ("BOT_TOKEN", "t"),
      ("LOCAL_BOT_API_URL", "http://bot-api:8081"),
    ])
    .unwrap();
    assert!(config.capable_api().is_none());

    let config = config_from(&[
      ("BOT_TOKEN", "t"),
      ("LOCAL_BOT_API_URL", "http://bot-api:8081"),
      ("TELEGRAM_API_ID", "12345"),
      ("TELEGRAM_API_HASH", "deadbeef"),
    ])
    .unwrap();
    assert_eq!(
      config.capable_api().map(Url::as_str),
      Some("http://bot-api:8081/")
    );
  }
}
