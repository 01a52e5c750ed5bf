use std::time::Duration;

use async_trait::async_trait;
use http_types::Url;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::{error::StrategyError, source::SourceRequest};

use super::{
  browser_headers, facebook_page, media_url, title_from_html, unescape_scraped,
  Extractor, Http, ResolvedMedia, StrategyId, Variant, VariantKind,
  DESKTOP_UA, FACEBOOK_CDN,
};

const DESKTOP_HOST: &str = "www.facebook.com";

// ordered by preference: hd renditions first
static PATTERNS: Lazy<Vec<(bool, Regex)>> = Lazy::new(|| {
  [
    (true, r#""browser_native_hd_url":"([^"]+)""#),
    (true, r#""playable_url_quality_hd":"([^"]+)""#),
    (true, r#"hd_src_no_ratelimit:"([^"]+)""#),
    (true, r#"hd_src:"([^"]+)""#),
    (false, r#""browser_native_sd_url":"([^"]+)""#),
    (false, r#""playable_url":"([^"]+)""#),
    (false, r#"sd_src:"([^"]+)""#),
  ]
  .into_iter()
  .map(|(hd, pattern)| (hd, Regex::new(pattern).unwrap()))
  .collect()
});

/// Scans the desktop page markup for known media url fields.
#[derive(Clone)]
pub struct PatternScan {
  http: Http,
}

impl PatternScan {
  pub fn new(http: Http) -> Self {
    Self { http }
  }
}

#[async_trait]
impl Extractor for PatternScan {
  fn id(&self) -> StrategyId {
    StrategyId::PatternScan
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

    let (hd, url) = scan(&html).ok_or(StrategyError::NoMedia("page markup"))?;
    let title = tl::parse(&html, tl::ParserOptions::default())
      .ok()
      .and_then(|dom| title_from_html(&dom));

    let variant = Variant::new(url.to_string(), VariantKind::Muxed, "mp4")
      .with_height(hd.then_some(720));
    Ok(ResolvedMedia {
      platform: request.platform(),
      title,
      variants: vec![variant],
    })
  }
}

/// First valid media url in pattern order, with whether it is an hd field.
pub fn scan(html: &str) -> Option<(bool, Url)> {
  PATTERNS.iter().find_map(|(hd, regex)| {
    regex
      .captures_iter(html)
      .find_map(|caps| media_url(&unescape_scraped(&caps[1]), FACEBOOK_CDN))
      .map(|url| (*hd, url))
  })
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn test_prefers_hd_fields() {
    let html = r#"<script>{"playable_url":"https:\/\/video.fbcdn.net\/v\/sd.mp4",
      "browser_native_hd_url":"https:\/\/video.fbcdn.net\/v\/hd.mp4?a=1&b=2"}
      </script>"#;

    let (hd, url) = scan(html).unwrap();
    assert!(hd);
    assert_eq!(url.as_str(), "https://video.fbcdn.net/v/hd.mp4?a=1&b=2");
  }

  #[test]
  fn test_skips_invalid_matches() {
    // the first match of the pattern is not a media url
    let html = r#"hd_src:"null" sd_src:"https:\/\/video.fbcdn.net\/v\/sd.mp4"
      hd_src:"https:\/\/video.fbcdn.net\/v\/hd.mp4""#;

    let (hd, url) = scan(html).unwrap();
    assert!(hd);
    assert_eq!(url.as_str(), "https://video.fbcdn.net/v/hd.mp4");
  }

  #[test]
  fn test_nothing_found() {
    assert_eq!(scan("<html><body>log in to continue</body></html>"), None);
  }
}
