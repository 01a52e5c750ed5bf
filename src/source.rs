use std::{fmt, net::IpAddr, str::FromStr};

use http_types::Url;
use serde::Serialize;

use crate::error::RequestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Platform {
  YouTube,
  Instagram,
  TikTok,
  Facebook,
  Twitter,
  Reddit,
  Vimeo,
  Other,
}

const PLATFORM_DOMAINS: &[(&str, Platform)] = &[
  ("youtube.com", Platform::YouTube),
  ("youtu.be", Platform::YouTube),
  ("instagram.com", Platform::Instagram),
  ("tiktok.com", Platform::TikTok),
  ("facebook.com", Platform::Facebook),
  ("fb.watch", Platform::Facebook),
  ("twitter.com", Platform::Twitter),
  ("x.com", Platform::Twitter),
  ("reddit.com", Platform::Reddit),
  ("redd.it", Platform::Reddit),
  ("vimeo.com", Platform::Vimeo),
];

impl Platform {
  pub fn detect(url: &Url) -> Self {
    let Some(host) = url.host_str() else {
      return Platform::Other;
    };
    let host = host.to_ascii_lowercase();

    PLATFORM_DOMAINS
      .iter()
      .find(|(domain, _)| {
        host == *domain
          || host
            .strip_suffix(domain)
            .map_or(false, |prefix| prefix.ends_with('.'))
      })
      .map(|(_, platform)| *platform)
      .unwrap_or(Platform::Other)
  }
}

impl fmt::Display for Platform {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Platform::YouTube => "YouTube",
      Platform::Instagram => "Instagram",
      Platform::TikTok => "TikTok",
      Platform::Facebook => "Facebook",
      Platform::Twitter => "Twitter/X",
      Platform::Reddit => "Reddit",
      Platform::Vimeo => "Vimeo",
      Platform::Other => "Other",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum VideoTier {
  Best,
  P1080,
  P720,
  P480,
  P360,
}

impl VideoTier {
  /// Upper bound on the frame height; `None` for `Best`.
  pub fn max_height(&self) -> Option<u32> {
    match self {
      VideoTier::Best => None,
      VideoTier::P1080 => Some(1080),
      VideoTier::P720 => Some(720),
      VideoTier::P480 => Some(480),
      VideoTier::P360 => Some(360),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AudioFormat {
  Mp3,
  M4a,
  Opus,
}

impl AudioFormat {
  pub fn extension(&self) -> &'static str {
    match self {
      AudioFormat::Mp3 => "mp3",
      AudioFormat::M4a => "m4a",
      AudioFormat::Opus => "opus",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Profile {
  Video(VideoTier),
  Audio(AudioFormat),
}

impl FromStr for Profile {
  type Err = RequestError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let profile = match s.trim().to_ascii_lowercase().as_str() {
      "best" => Profile::Video(VideoTier::Best),
      "1080p" => Profile::Video(VideoTier::P1080),
      "720p" => Profile::Video(VideoTier::P720),
      "480p" => Profile::Video(VideoTier::P480),
      "360p" => Profile::Video(VideoTier::P360),
      "mp3" => Profile::Audio(AudioFormat::Mp3),
      "m4a" => Profile::Audio(AudioFormat::M4a),
      "opus" => Profile::Audio(AudioFormat::Opus),
      _ => return Err(RequestError::Profile(s.to_string())),
    };
    Ok(profile)
  }
}

impl fmt::Display for Profile {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Profile::Video(VideoTier::Best) => f.write_str("best"),
      Profile::Video(tier) => {
        write!(f, "{}p", tier.max_height().unwrap_or_default())
      }
      Profile::Audio(format) => f.write_str(format.extension()),
    }
  }
}

/// A validated request for one piece of media. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRequest {
  url: Url,
  platform: Platform,
  profile: Profile,
}

impl SourceRequest {
  pub fn new(url: &str, profile: Profile) -> Result<Self, RequestError> {
    let parsed: Url = url
      .trim()
      .parse()
      .map_err(|_| RequestError::InvalidUrl(url.to_string()))?;
    validate_url(&parsed)?;

    Ok(Self {
      platform: Platform::detect(&parsed),
      url: parsed,
      profile,
    })
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  pub fn platform(&self) -> Platform {
    self.platform
  }

  pub fn profile(&self) -> &Profile {
    &self.profile
  }
}

const BLOCKED_HOSTNAMES: &[&str] = &[
  "localhost",
  "metadata",
  "metadata.google.internal",
  "metadata.goog",
];

// user supplied urls must never reach internal networks
fn validate_url(url: &Url) -> Result<(), RequestError> {
  match url.scheme() {
    "http" | "https" => (),
    scheme => return Err(RequestError::Scheme(scheme.to_string())),
  }

  let host = url
    .host_str()
    .ok_or_else(|| RequestError::InvalidUrl(url.to_string()))?
    .trim_start_matches('[')
    .trim_end_matches(']')
    .to_ascii_lowercase();

  let blocked = BLOCKED_HOSTNAMES.contains(&host.as_str())
    || host.ends_with(".localhost")
    || host.ends_with(".internal")
    || host.parse::<IpAddr>().map_or(false, is_internal_ip);

  if blocked {
    return Err(RequestError::BlockedHost(host));
  }

  Ok(())
}

fn is_internal_ip(ip: IpAddr) -> bool {
  match ip {
    IpAddr::V4(v4) => {
      v4.is_loopback()
        || v4.is_private()
        || v4.is_link_local()
        || v4.is_unspecified()
        || v4.is_broadcast()
    }
    IpAddr::V6(v6) => {
      if let Some(v4) = v6.to_ipv4_mapped() {
        return is_internal_ip(IpAddr::V4(v4));
      }
      let first = v6.segments()[0];
      v6.is_loopback()
        || v6.is_unspecified()
        // unique local fc00::/7
        || (first & 0xfe00) == 0xfc00
        // link local fe80::/10, deprecated site local fec0::/10
        || (first & 0xffc0) == 0xfe80
        || (first & 0xffc0) == 0xfec0
    }
  }
}
