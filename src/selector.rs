use serde::Serialize;
use tracing::debug;

use crate::{
  error::SelectionError,
  extractor::{ResolvedMedia, Variant, VariantKind},
  fetch::ArtifactKind,
  source::{AudioFormat, Profile, VideoTier},
};

/// Audio variants above this size are only picked when nothing smaller is
/// offered.
pub const AUDIO_SOFT_CEILING: u64 = 10 * 1024 * 1024;

/// The requested tier had no variant at or below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Downgrade {
  pub requested: VideoTier,
  pub selected_height: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
  pub variant: Variant,
  /// Separate audio track to mux into a video-only `variant`.
  pub audio: Option<Variant>,
  pub kind: ArtifactKind,
  pub title: Option<String>,
  pub downgrade: Option<Downgrade>,
  /// Target format when the variant has to be transcoded after download.
  pub conversion: Option<AudioFormat>,
  /// Audio is delivered in the variant's own container because no
  /// converter is available.
  pub native_fallback: bool,
}

impl Selection {
  /// Bytes to download, when every part declares its size.
  pub fn declared_size(&self) -> Option<u64> {
    match &self.audio {
      Some(audio) => Some(self.variant.size? + audio.size?),
      None => self.variant.size,
    }
  }
}

#[derive(Debug, Clone, Copy)]
pub struct Selector {
  converter_available: bool,
  audio_ceiling: u64,
}

impl Selector {
  pub fn new(converter_available: bool) -> Self {
    Self {
      converter_available,
      audio_ceiling: AUDIO_SOFT_CEILING,
    }
  }

  pub fn select(
    &self,
    media: &ResolvedMedia,
    profile: &Profile,
  ) -> Result<Selection, SelectionError> {
    if media.variants.is_empty() {
      return Err(SelectionError::NoUsableVariant);
    }

    let selection = match profile {
      Profile::Video(tier) => self.select_video(media, *tier),
      Profile::Audio(format) => self.select_audio(media, *format),
    }
    .ok_or(SelectionError::NoUsableVariant)?;

    debug!(
      %profile,
      container = %selection.variant.container,
      height = ?selection.variant.height,
      size = ?selection.variant.size,
      "variant selected"
    );
    Ok(selection)
  }

  fn select_video(
    &self,
    media: &ResolvedMedia,
    tier: VideoTier,
  ) -> Option<Selection> {
    let audio_tracks = pool(media, &[VariantKind::AudioOnly]);
    // separate streams are only usable if they can be muxed back together
    let pool = if self.converter_available && !audio_tracks.is_empty() {
      media
        .variants
        .iter()
        .filter(|v| v.kind != VariantKind::AudioOnly)
        .collect()
    } else {
      pool(
        media,
        &[VariantKind::Muxed, VariantKind::VideoOnly, VariantKind::AudioOnly],
      )
    };
    let cap = tier.max_height().unwrap_or(u32::MAX);

    let within = pool
      .iter()
      .filter(|v| v.height.map_or(false, |h| h <= cap))
      .max_by_key(|v| {
        (
          v.height,
          v.kind == VariantKind::Muxed,
          v.container.eq_ignore_ascii_case("mp4"),
          v.bitrate_kbps,
        )
      });
    // scrapers often can't tell the height; trust their single rendition
    let unknown = || pool.iter().find(|v| v.height.is_none());
    let lowest = || {
      pool
        .iter()
        .filter(|v| v.height.is_some())
        .min_by_key(|v| (v.height, std::cmp::Reverse(v.bitrate_kbps)))
    };

    let (variant, downgrade) = match within.or_else(unknown) {
      Some(variant) => (variant, None),
      None => {
        let variant = lowest()?;
        let downgrade = variant.height.map(|selected_height| Downgrade {
          requested: tier,
          selected_height,
        });
        (variant, downgrade)
      }
    };

    let audio = match variant.kind {
      VariantKind::VideoOnly if self.converter_available => audio_tracks
        .iter()
        .max_by_key(|a| (mp4_audio(a), a.bitrate_kbps))
        .map(|a| (*a).clone()),
      _ => None,
    };

    Some(Selection {
      variant: (*variant).clone(),
      audio,
      kind: ArtifactKind::Video,
      title: media.title.clone(),
      downgrade,
      conversion: None,
      native_fallback: false,
    })
  }

  fn select_audio(
    &self,
    media: &ResolvedMedia,
    format: AudioFormat,
  ) -> Option<Selection> {
    let pool = pool(
      media,
      &[VariantKind::AudioOnly, VariantKind::Muxed, VariantKind::VideoOnly],
    );

    fn best_bitrate<'a>(
      candidates: Vec<&&'a Variant>,
    ) -> Option<&'a Variant> {
      candidates
        .into_iter()
        .max_by_key(|v| v.bitrate_kbps)
        .copied()
    }

    let under_ceiling: Vec<_> = pool
      .iter()
      .filter(|v| v.size.map_or(false, |s| s <= self.audio_ceiling))
      .collect();
    let unknown_size: Vec<_> =
      pool.iter().filter(|v| v.size.is_none()).collect();

    let variant = best_bitrate(under_ceiling)
      .or_else(|| best_bitrate(unknown_size))
      .or_else(|| pool.iter().min_by_key(|v| v.size).copied())?;

    let native = variant.container.eq_ignore_ascii_case(format.extension());
    let (conversion, native_fallback) = match (native, self.converter_available)
    {
      (true, _) => (None, false),
      (false, true) => (Some(format), false),
      (false, false) => (None, true),
    };

    Some(Selection {
      variant: variant.clone(),
      audio: None,
      kind: ArtifactKind::Audio,
      title: media.title.clone(),
      downgrade: None,
      conversion,
      native_fallback,
    })
  }
}

// muxes into mp4 without re-encoding
pub fn mp4_audio(variant: &Variant) -> bool {
  ["m4a", "mp4"]
    .iter()
    .any(|ext| variant.container.eq_ignore_ascii_case(ext))
}

// all variants of the first kind in preference order that has any
fn pool<'a>(
  media: &'a ResolvedMedia,
  preference: &[VariantKind],
) -> Vec<&'a Variant> {
  preference
    .iter()
    .map(|kind| {
      media
        .variants
        .iter()
        .filter(|v| v.kind == *kind)
        .collect::<Vec<_>>()
    })
    .find(|group| !group.is_empty())
    .unwrap_or_default()
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::source::Platform;

  fn media(variants: Vec<Variant>) -> ResolvedMedia {
    ResolvedMedia {
      platform: Platform::YouTube,
      title: Some("title".into()),
      variants,
    }
  }

  fn video(height: u32, kind: VariantKind) -> Variant {
    Variant::new(format!("https://cdn/{height}"), kind, "mp4")
      .with_height(Some(height))
  }

  fn audio(name: &str, container: &str, kbps: u32, size: u64) -> Variant {
    let url = format!("https://cdn/{name}");
    Variant::new(url, VariantKind::AudioOnly, container)
      .with_bitrate(Some(kbps))
      .with_size(Some(size))
  }

  #[test]
  fn test_video_tier_picks_closest_below() {
    let media = media(vec![
      video(360, VariantKind::Muxed),
      video(720, VariantKind::Muxed),
      video(1080, VariantKind::Muxed),
      // higher quality but not muxed
      video(1440, VariantKind::VideoOnly),
    ]);
    let selector = Selector::new(true);

    let pick = |tier| {
      selector
        .select(&media, &Profile::Video(tier))
        .unwrap()
        .variant
        .height
    };
    assert_eq!(pick(VideoTier::Best), Some(1080));
    assert_eq!(pick(VideoTier::P1080), Some(1080));
    assert_eq!(pick(VideoTier::P720), Some(720));
    assert_eq!(pick(VideoTier::P480), Some(360));
  }

  #[test]
  fn test_video_only_with_audio_track_when_muxing_is_possible() {
    let media = media(vec![
      video(360, VariantKind::Muxed),
      video(1080, VariantKind::VideoOnly).with_size(Some(4000)),
      video(720, VariantKind::VideoOnly),
      Variant::new("https://cdn/720.webm", VariantKind::VideoOnly, "webm")
        .with_height(Some(720))
        .with_bitrate(Some(9000)),
      audio("opus", "webm", 160, 1024),
      audio("aac", "m4a", 128, 1000),
    ]);

    let selection = Selector::new(true)
      .select(&media, &Profile::Video(VideoTier::P720))
      .unwrap();
    assert_eq!(selection.variant.url, "https://cdn/720");
    assert_eq!(selection.variant.kind, VariantKind::VideoOnly);
    let audio = selection.audio.as_ref().unwrap();
    assert_eq!(audio.url, "https://cdn/aac");

    let best = Selector::new(true)
      .select(&media, &Profile::Video(VideoTier::Best))
      .unwrap();
    assert_eq!(best.variant.height, Some(1080));
    assert_eq!(best.declared_size(), Some(5000));

    // without a converter the streams can't be joined
    let muxed = Selector::new(false)
      .select(&media, &Profile::Video(VideoTier::P720))
      .unwrap();
    assert_eq!(muxed.variant.height, Some(360));
    assert_eq!(muxed.audio, None);
  }

  #[test]
  fn test_video_downgrade_note() {
    let media = media(vec![
      video(720, VariantKind::Muxed),
      video(480, VariantKind::Muxed),
    ]);
    let selection = Selector::new(true)
      .select(&media, &Profile::Video(VideoTier::P360))
      .unwrap();

    assert_eq!(selection.variant.height, Some(480));
    assert_eq!(
      selection.downgrade,
      Some(Downgrade {
        requested: VideoTier::P360,
        selected_height: 480,
      })
    );
  }

  #[test]
  fn test_unknown_height_is_accepted() {
    let media = media(vec![Variant::new(
      "https://video.fbcdn.net/v.mp4",
      VariantKind::Muxed,
      "mp4",
    )]);
    let selection = Selector::new(false)
      .select(&media, &Profile::Video(VideoTier::P480))
      .unwrap();

    assert_eq!(selection.kind, ArtifactKind::Video);
    assert_eq!(selection.downgrade, None);
  }

  #[test]
  fn test_audio_prefers_small_variants() {
    let media = media(vec![
      audio("big", "m4a", 256, AUDIO_SOFT_CEILING + 1),
      audio("mid", "m4a", 128, 4 * 1024 * 1024),
      audio("low", "webm", 64, 2 * 1024 * 1024),
    ]);
    let selection = Selector::new(true)
      .select(&media, &Profile::Audio(AudioFormat::M4a))
      .unwrap();

    assert_eq!(selection.variant.url, "https://cdn/mid");
    assert_eq!(selection.conversion, None);
    assert!(!selection.native_fallback);
  }

  #[test]
  fn test_audio_conversion_and_native_fallback() {
    let media = media(vec![audio("a", "webm", 128, 1024)]);
    let profile = Profile::Audio(AudioFormat::Mp3);

    let converted = Selector::new(true).select(&media, &profile).unwrap();
    assert_eq!(converted.conversion, Some(AudioFormat::Mp3));
    assert!(!converted.native_fallback);

    let native = Selector::new(false).select(&media, &profile).unwrap();
    assert_eq!(native.conversion, None);
    assert!(native.native_fallback);
    assert_eq!(native.variant.container, "webm");
  }

  #[test]
  fn test_audio_from_muxed_when_no_audio_only() {
    let media = media(vec![video(720, VariantKind::Muxed)]);
    let selection = Selector::new(true)
      .select(&media, &Profile::Audio(AudioFormat::Mp3))
      .unwrap();

    assert_eq!(selection.kind, ArtifactKind::Audio);
    assert_eq!(selection.conversion, Some(AudioFormat::Mp3));
  }

  #[test]
  fn test_no_variants() {
    let profile = Profile::Video(VideoTier::Best);
    assert_eq!(
      Selector::new(true).select(&media(vec![]), &profile),
      Err(SelectionError::NoUsableVariant)
    );
  }
}
