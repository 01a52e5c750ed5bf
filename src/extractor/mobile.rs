use std::time::Duration;

use async_trait::async_trait;
use http_types::Url;

use crate::{error::StrategyError, source::SourceRequest};

use super::{
  browser_headers, facebook_page, media_url, title_from_html, unescape_scraped,
  Extractor, Http, ResolvedMedia, StrategyId, Variant, VariantKind,
  ANDROID_UA, FACEBOOK_CDN,
};

// the basic mobile site serves plain html with direct video links
const MOBILE_HOST: &str = "mbasic.facebook.com";

#[derive(Clone)]
pub struct MobileScrape {
  http: Http,
}

impl MobileScrape {
  pub fn new(http: Http) -> Self {
    Self { http }
  }
}

#[async_trait]
impl Extractor for MobileScrape {
  fn id(&self) -> StrategyId {
    StrategyId::MobileScrape
  }

  // short link expansion, then the page itself
  fn timeout(&self) -> Duration {
    self.http.budget() * 2
  }

  async fn extract(
    &self,
    request: &SourceRequest,
  ) -> Result<ResolvedMedia, StrategyError> {
    let page = facebook_page(&self.http, request.url(), MOBILE_HOST).await?;
    let (final_url, html) = self
      .http
      .get_text(page.as_str(), &browser_headers(ANDROID_UA))
      .await?;

    let (title, url) = scrape(&final_url, &html)?;
    Ok(ResolvedMedia {
      platform: request.platform(),
      title,
      variants: vec![Variant::new(url.to_string(), VariantKind::Muxed, "mp4")],
    })
  }
}

fn scrape(
  page: &Url,
  html: &str,
) -> Result<(Option<String>, Url), StrategyError> {
  let lower = html.to_ascii_lowercase();
  if lower.contains("content isn't available")
    || lower.contains("content isn&#039;t available")
  {
    return Err(StrategyError::Restricted("content isn't available".into()));
  }

  let dom = tl::parse(html, tl::ParserOptions::default())
    .map_err(|e| StrategyError::Malformed(e.to_string()))?;
  let title = title_from_html(&dom);

  let videos = dom
    .query_selector("video")
    .into_iter()
    .flatten()
    .filter_map(|node| attribute(&dom, node, "src"));
  let links = dom
    .query_selector("a")
    .into_iter()
    .flatten()
    .filter_map(|node| attribute(&dom, node, "href"))
    .filter_map(|href| redirect_target(page, &href));

  let url = videos.chain(links).find_map(|candidate| {
    media_url(&unescape_scraped(&candidate), FACEBOOK_CDN)
  });

  match url {
    Some(url) => Ok((title, url)),
    // a login wall hides the media but says nothing about the content itself
    None => Err(StrategyError::NoMedia("mobile page")),
  }
}

fn attribute(
  dom: &tl::VDom<'_>,
  handle: tl::NodeHandle,
  name: &str,
) -> Option<String> {
  let tag = handle.get(dom.parser())?.as_tag()?;
  let value = tag.attributes().get(name)??;
  Some(value.as_utf8_str().into_owned())
}

// `/video_redirect/?src=<url>` links carry the media url as a parameter;
// other links are taken as-is
fn redirect_target(page: &Url, href: &str) -> Option<String> {
  let href = unescape_scraped(href);
  let link = page.join(&href).ok()?;
  if link.path().starts_with("/video_redirect") {
    return link
      .query_pairs()
      .find(|(key, _)| key == "src")
      .map(|(_, value)| value.into_owned());
  }
  Some(link.to_string())
}

#[cfg(test)]
mod test {
  use super::*;

  fn page() -> Url {
    "https://mbasic.facebook.com/watch/?v=42".parse().unwrap()
  }

  #[test]
  fn test_scrape_video_tag() {
    let html = r#"<html><head><title>Cat video</title></head><body>
      <video src="https://video.xx.fbcdn.net/v/t42/clip.mp4?a=1&amp;b=2"></video>
      </body></html>"#;

    let (title, url) = scrape(&page(), html).unwrap();
    assert_eq!(title.as_deref(), Some("Cat video"));
    assert_eq!(
      url.as_str(),
      "https://video.xx.fbcdn.net/v/t42/clip.mp4?a=1&b=2"
    );
  }

  #[test]
  fn test_scrape_redirect_link() {
    let html = r#"<html><body>
      <a href="/home.php">home</a>
      <a href="/video_redirect/?src=https%3A%2F%2Fvideo.fbcdn.net%2Fv%2Fclip.mp4">play</a>
      </body></html>"#;

    let (title, url) = scrape(&page(), html).unwrap();
    assert_eq!(title, None);
    assert_eq!(url.as_str(), "https://video.fbcdn.net/v/clip.mp4");
  }

  #[test]
  fn test_login_wall_is_not_restricted() {
    let html = r#"<html><body><form action="/login/">Log in</form></body></html>"#;
    assert_eq!(
      scrape(&page(), html),
      Err(StrategyError::NoMedia("mobile page"))
    );
  }

  #[test]
  fn test_unavailable_content() {
    let html = "<html><body>This content isn't available right now</body></html>";
    assert!(matches!(
      scrape(&page(), html),
      Err(StrategyError::Restricted(_))
    ));
  }
}
