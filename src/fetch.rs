use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use tokio::fs::File;
use tracing::{debug, info, warn};

use crate::{
  convert::Converter,
  error::{ConvertError, FetchError, StorageError, StrategyError},
  extractor::Variant,
  retry::RetryPolicy,
  selector::{mp4_audio, Selection},
  source::AudioFormat,
  storage::{sanitize_filename, Storage, StoredFile, MAX_STEM_LEN},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
  Video,
  Audio,
}

/// A downloaded payload ready for delivery. Its storage is released when
/// the artifact is dropped.
pub struct Artifact {
  file: StoredFile,
  pub kind: ArtifactKind,
  /// Container extension of the stored bytes.
  pub format: String,
  pub title: Option<String>,
  /// Audio kept in its native container because conversion was not done.
  pub native_fallback: bool,
}

impl Artifact {
  pub fn new(
    file: StoredFile,
    kind: ArtifactKind,
    format: impl Into<String>,
    title: Option<String>,
  ) -> Self {
    Self {
      file,
      kind,
      format: format.into(),
      title,
      native_fallback: false,
    }
  }

  pub fn size(&self) -> u64 {
    self.file.size()
  }

  pub async fn open(&self) -> Result<File, StorageError> {
    self.file.open().await
  }

  /// Name presented to the recipient.
  pub fn file_name(&self) -> String {
    let stem = self.title.as_deref().unwrap_or("media");
    format!("{}.{}", sanitize_filename(stem, MAX_STEM_LEN), self.format)
  }

  pub fn mime_type(&self) -> &'static str {
    match (self.format.as_str(), self.kind) {
      ("mp3", _) => "audio/mpeg",
      ("m4a", _) | ("mp4", ArtifactKind::Audio) => "audio/mp4",
      ("opus", _) | ("ogg", _) => "audio/ogg",
      ("webm", ArtifactKind::Audio) => "audio/webm",
      ("webm", ArtifactKind::Video) => "video/webm",
      ("mp4", ArtifactKind::Video) => "video/mp4",
      ("mov", _) => "video/quicktime",
      ("mkv", _) => "video/x-matroska",
      _ => "application/octet-stream",
    }
  }
}

/// Streams a selected variant into temporary storage.
#[derive(Clone)]
pub struct Fetcher {
  client: reqwest::Client,
  retry: RetryPolicy,
  converter: Option<Converter>,
}

impl Fetcher {
  pub fn new(
    client: reqwest::Client,
    retry: RetryPolicy,
    converter: Option<Converter>,
  ) -> Self {
    Self {
      client,
      retry,
      converter,
    }
  }

  pub async fn fetch(
    &self,
    selection: &Selection,
    storage: &Storage,
  ) -> Result<Artifact, FetchError> {
    let stem = selection.title.as_deref().unwrap_or("media");
    let video = self.download(&selection.variant, stem, storage).await?;

    let (file, format) = match &selection.audio {
      Some(audio_variant) => {
        let audio = self.download(audio_variant, stem, storage).await?;
        let format = merged_container(&selection.variant, audio_variant);
        let merged = self.merge(video, audio, stem, format, storage).await?;
        (merged, format.to_string())
      }
      None => (video, selection.variant.container.to_ascii_lowercase()),
    };

    let mut artifact = Artifact {
      native_fallback: selection.native_fallback,
      ..Artifact::new(file, selection.kind, format, selection.title.clone())
    };

    if let Some(format) = selection.conversion {
      artifact = self.convert(artifact, format, storage).await?;
    }

    Ok(artifact)
  }

  async fn download(
    &self,
    variant: &Variant,
    stem: &str,
    storage: &Storage,
  ) -> Result<StoredFile, FetchError> {
    let mut file = storage.create(stem, &variant.container).await?;
    if let Some(size) = variant.size {
      file.reserve(size)?;
    }

    let headers = header_map(&variant.headers);
    let resp = self
      .retry
      .run(|_| {
        let request = self.client.get(&variant.url).headers(headers.clone());
        async move {
          let resp = request.send().await?;
          match StrategyError::from_status(resp.status()) {
            Some(err) => Err(err),
            None => Ok(resp),
          }
        }
      })
      .await
      .result
      .map_err(FetchError::Http)?;

    // fail before downloading anything that can't fit
    if let Some(len) = resp.content_length() {
      file.reserve(len)?;
    }

    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
      let chunk = chunk.map_err(|e| FetchError::Http(e.into()))?;
      file.write_chunk(&chunk).await?;
    }
    file.finish().await?;
    debug!(size = file.size(), "download finished");

    Ok(file)
  }

  // both inputs are released once the merged file exists
  async fn merge(
    &self,
    video: StoredFile,
    audio: StoredFile,
    stem: &str,
    format: &str,
    storage: &Storage,
  ) -> Result<StoredFile, FetchError> {
    let converter = self
      .converter
      .as_ref()
      .ok_or(FetchError::Merge(ConvertError::Unavailable))?;

    let mut output = storage.create(stem, format).await?;
    output.reserve(video.size() + audio.size())?;
    converter
      .merge(video.path(), audio.path(), output.path())
      .await
      .map_err(FetchError::Merge)?;
    output.sync_size().await?;

    info!(format, size = output.size(), "video and audio merged");
    Ok(output)
  }

  // a failed conversion keeps the native download
  async fn convert(
    &self,
    artifact: Artifact,
    format: AudioFormat,
    storage: &Storage,
  ) -> Result<Artifact, FetchError> {
    let Some(converter) = &self.converter else {
      return Ok(Artifact {
        native_fallback: true,
        ..artifact
      });
    };

    let stem = artifact.title.as_deref().unwrap_or("media");
    let mut output = storage.create(stem, format.extension()).await?;

    match converter
      .convert(artifact.file.path(), output.path(), format)
      .await
    {
      Ok(()) => {
        output.sync_size().await?;
        info!(
          format = format.extension(),
          size = output.size(),
          "audio converted"
        );
        Ok(Artifact {
          file: output,
          format: format.extension().to_string(),
          native_fallback: false,
          ..artifact
        })
      }
      Err(e) => {
        warn!(format = format.extension(), "conversion failed: {e}");
        Ok(Artifact {
          native_fallback: true,
          ..artifact
        })
      }
    }
  }
}

// mp4 holds the streams as they are; anything else goes into matroska
fn merged_container(video: &Variant, audio: &Variant) -> &'static str {
  if video.container.eq_ignore_ascii_case("mp4") && mp4_audio(audio) {
    "mp4"
  } else {
    "mkv"
  }
}

fn header_map(headers: &[(String, String)]) -> HeaderMap {
  headers
    .iter()
    .filter_map(|(name, value)| {
      let name = HeaderName::from_bytes(name.as_bytes()).ok()?;
      let value = HeaderValue::from_str(value).ok()?;
      Some((name, value))
    })
    .collect()
}
