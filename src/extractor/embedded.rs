use std::time::Duration;

use async_trait::async_trait;
use http_types::Url;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::{error::StrategyError, source::SourceRequest};

use super::{
  browser_headers, facebook_page, media_url, Extractor, Http, ResolvedMedia,
  StrategyId, Variant, VariantKind, DESKTOP_UA, FACEBOOK_CDN,
};

const DESKTOP_HOST: &str = "www.facebook.com";

static DELIVERY_FIELDS: Lazy<Regex> = Lazy::new(|| {
  Regex::new(r#""videoDeliveryLegacyFields"\s*:\s*(\{[^}]+\})"#).unwrap()
});
static LD_JSON: Lazy<Regex> = Lazy::new(|| {
  Regex::new(
    r#"(?s)<script[^>]*type="application/ld\+json"[^>]*>(.*?)</script>"#,
  )
  .unwrap()
});

const DELIVERY_KEYS: &[(&str, bool)] = &[
  ("browser_native_hd_url", true),
  ("browser_native_sd_url", false),
  ("playable_url_quality_hd", true),
  ("playable_url", false),
];

/// Reads media urls out of structured data objects embedded in the page.
#[derive(Clone)]
pub struct EmbeddedJson {
  http: Http,
}

impl EmbeddedJson {
  pub fn new(http: Http) -> Self {
    Self { http }
  }
}

#[async_trait]
impl Extractor for EmbeddedJson {
  fn id(&self) -> StrategyId {
    StrategyId::EmbeddedJson
  }

  // short link expansion, then the page itself
  fn timeout(&self) -> Duration {
    self.http.budget() * 2
  }

  async fn extract(
    &self,
    request: &SourceRequest,
  ) -> Result<ResolvedMedia, StrategyError> {
    let page = facebook_page(&self.http, request.url(), DESKTOP_HOST).await?;
    let (_, html) = self
      .http
      .get_text(page.as_str(), &browser_headers(DESKTOP_UA))
      .await?;

    let found = delivery_fields(&html)
      .or_else(|| linked_data(&html))
      .ok_or(StrategyError::NoMedia("embedded json"))?;

    let variant =
      Variant::new(found.url.to_string(), VariantKind::Muxed, "mp4")
        .with_height(found.hd.then_some(720));
    Ok(ResolvedMedia {
      platform: request.platform(),
      title: found.title,
      variants: vec![variant],
    })
  }
}

#[derive(Debug, PartialEq)]
struct Found {
  url: Url,
  hd: bool,
  title: Option<String>,
}

fn delivery_fields(html: &str) -> Option<Found> {
  DELIVERY_FIELDS.captures_iter(html).find_map(|caps| {
    let fields: Value = serde_json::from_str(&caps[1]).ok()?;
    DELIVERY_KEYS.iter().find_map(|(key, hd)| {
      let url = media_url(fields.get(key)?.as_str()?, FACEBOOK_CDN)?;
      Some(Found {
        url,
        hd: *hd,
        title: None,
      })
    })
  })
}

fn linked_data(html: &str) -> Option<Found> {
  LD_JSON.captures_iter(html).find_map(|caps| {
    let data: Value = serde_json::from_str(caps[1].trim()).ok()?;
    let url = content_url(&data)?;
    let title = data.get("name").and_then(Value::as_str).map(String::from);
    Some(Found {
      url,
      hd: false,
      title,
    })
  })
}

// `contentUrl` may sit on the root object or on a nested VideoObject
fn content_url(value: &Value) -> Option<Url> {
  match value {
    Value::Object(map) => map
      .get("contentUrl")
      .and_then(Value::as_str)
      .and_then(|url| media_url(url, FACEBOOK_CDN))
      .or_else(|| map.values().find_map(content_url)),
    Value::Array(items) => items.iter().find_map(content_url),
    _ => None,
  }
}
