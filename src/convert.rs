use std::{path::Path, process::Stdio};

use itertools::Itertools;
use tokio::process::Command;
use tracing::{info, warn};

use crate::{error::ConvertError, source::AudioFormat};

// run ffmpeg command line to transcode downloaded audio or to mux
// separate video and audio streams.
// requires ffmpeg executable to be in PATH.
#[derive(Debug, Clone)]
pub struct Converter {
  program: String,
}

impl Converter {
  /// Returns a converter only if `program -version` runs successfully.
  pub async fn detect(program: &str) -> Option<Self> {
    let status = Command::new(program)
      .arg("-version")
      .stdin(Stdio::null())
      .stdout(Stdio::null())
      .stderr(Stdio::null())
      .kill_on_drop(true)
      .status()
      .await;

    match status {
      Ok(status) if status.success() => {
        info!(program, "audio converter available");
        Some(Self {
          program: program.to_string(),
        })
      }
      Ok(status) => {
        warn!(program, %status, "audio converter unusable");
        None
      }
      Err(e) => {
        warn!(program, "audio converter not found: {e}");
        None
      }
    }
  }

  pub async fn convert(
    &self,
    input: &Path,
    output: &Path,
    format: AudioFormat,
  ) -> Result<(), ConvertError> {
    self.run(ffmpeg_args(input, output, format)).await
  }

  /// Joins a video-only and an audio-only stream without re-encoding.
  pub async fn merge(
    &self,
    video: &Path,
    audio: &Path,
    output: &Path,
  ) -> Result<(), ConvertError> {
    self.run(merge_args(video, audio, output)).await
  }

  async fn run(&self, args: Vec<String>) -> Result<(), ConvertError> {
    let result = Command::new(&self.program)
      .args(args)
      .stdin(Stdio::null())
      .kill_on_drop(true)
      .output()
      .await?;

    if !result.status.success() {
      let stderr = String::from_utf8_lossy(&result.stderr);
      // ffmpeg prints its banner first; the cause is at the end
      let tail: Vec<_> = stderr.lines().rev().take(5).collect();
      return Err(ConvertError::Failed {
        status: result.status.to_string(),
        stderr: tail.into_iter().rev().join("\n"),
      });
    }

    Ok(())
  }
}

fn ffmpeg_args(
  input: &Path,
  output: &Path,
  format: AudioFormat,
) -> Vec<String> {
  let (codec, bitrate) = match format {
    AudioFormat::Mp3 => ("libmp3lame", "192k"),
    AudioFormat::M4a => ("aac", "192k"),
    AudioFormat::Opus => ("libopus", "128k"),
  };

  vec![
    "-hide_banner".into(),
    "-loglevel".into(),
    "error".into(),
    "-y".into(),
    "-i".into(),
    input.to_string_lossy().into_owned(),
    "-vn".into(),
    "-c:a".into(),
    codec.into(),
    "-b:a".into(),
    bitrate.into(),
    output.to_string_lossy().into_owned(),
  ]
}

fn merge_args(video: &Path, audio: &Path, output: &Path) -> Vec<String> {
  let path = |p: &Path| p.to_string_lossy().into_owned();
  vec![
    "-hide_banner".into(),
    "-loglevel".into(),
    "error".into(),
    "-y".into(),
    "-i".into(),
    path(video),
    "-i".into(),
    path(audio),
    "-map".into(),
    "0:v:0".into(),
    "-map".into(),
    "1:a:0".into(),
    "-c".into(),
    "copy".into(),
    path(output),
  ]
}
