use std::{fmt::Display, time::Duration};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serializer;

// used to remove cred info from proxy url before printing
static AUTH_REGEX: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"//[^:/@]+(:[^@]+)?@").unwrap());

pub fn redact_credentials(url: &str) -> String {
  AUTH_REGEX.replace(url, "//<REDACTED>@").into_owned()
}

pub fn serialize_millis<S: Serializer>(
  duration: &Duration,
  serializer: S,
) -> Result<S::Ok, S::Error> {
  serializer.serialize_u64(duration.as_millis() as u64)
}

pub fn serialize_display_opt<T: Display, S: Serializer>(
  value: &Option<T>,
  serializer: S,
) -> Result<S::Ok, S::Error> {
  match value {
    Some(value) => serializer.collect_str(value),
    None => serializer.serialize_none(),
  }
}
