use std::{
  path::{Path, PathBuf},
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
  },
};

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::{fs::File, io::AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::StorageError;

pub const MAX_STEM_LEN: usize = 50;

// marks the files we own; the directory itself may be shared
const FILE_PREFIX: &str = "relay-";

/// Byte-bounded scratch directory for artifacts in flight.
///
/// Every byte written goes through a reservation; a [`StoredFile`] gives its
/// bytes back and deletes itself when dropped.
#[derive(Clone)]
pub struct Storage {
  inner: Arc<Inner>,
}

struct Inner {
  base_dir: PathBuf,
  capacity: u64,
  used: Mutex<u64>,
  next_id: AtomicU64,
}

impl Storage {
  pub fn new(
    base_dir: impl AsRef<Path>,
    capacity: u64,
  ) -> Result<Self, StorageError> {
    let base_dir = base_dir.as_ref().to_owned();
    std::fs::create_dir_all(&base_dir)?;
    sweep_leftovers(&base_dir)?;

    Ok(Self {
      inner: Arc::new(Inner {
        base_dir,
        capacity,
        used: Mutex::new(0),
        next_id: AtomicU64::new(0),
      }),
    })
  }

  pub fn capacity(&self) -> u64 {
    self.inner.capacity
  }

  pub fn used_bytes(&self) -> u64 {
    *self.inner.used.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn base_dir(&self) -> &Path {
    &self.inner.base_dir
  }

  pub async fn create(
    &self,
    stem: &str,
    extension: &str,
  ) -> Result<StoredFile, StorageError> {
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
    let name = format!(
      "{FILE_PREFIX}{id}-{}.{}",
      sanitize_filename(stem, MAX_STEM_LEN),
      sanitize_filename(extension, 8)
    );
    let path = self.inner.base_dir.join(name);
    let file = File::create(&path).await?;

    Ok(StoredFile {
      storage: self.clone(),
      path,
      file: Some(file),
      reserved: 0,
      written: 0,
    })
  }

  fn reserve(&self, bytes: u64) -> Result<(), StorageError> {
    let mut used = self.inner.used.lock().unwrap_or_else(|e| e.into_inner());
    let available = self.inner.capacity.saturating_sub(*used);
    if bytes > available {
      return Err(StorageError::Full {
        requested: bytes,
        available,
      });
    }
    *used += bytes;
    Ok(())
  }

  fn release(&self, bytes: u64) {
    let mut used = self.inner.used.lock().unwrap_or_else(|e| e.into_inner());
    *used = used.saturating_sub(bytes);
  }
}

pub struct StoredFile {
  storage: Storage,
  path: PathBuf,
  file: Option<File>,
  reserved: u64,
  written: u64,
}

impl StoredFile {
  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Bytes of content written so far.
  pub fn size(&self) -> u64 {
    self.written
  }

  /// Grows the reservation to at least `total` bytes.
  pub fn reserve(&mut self, total: u64) -> Result<(), StorageError> {
    if total > self.reserved {
      self.storage.reserve(total - self.reserved)?;
      self.reserved = total;
    }
    Ok(())
  }

  pub async fn write_chunk(
    &mut self,
    chunk: &[u8],
  ) -> Result<(), StorageError> {
    let total = self.written + chunk.len() as u64;
    self.reserve(total)?;

    let mut file = match self.file.take() {
      Some(file) => file,
      None => {
        tokio::fs::OpenOptions::new()
          .append(true)
          .open(&self.path)
          .await?
      }
    };
    file.write_all(chunk).await?;
    self.file = Some(file);
    self.written = total;
    Ok(())
  }

  /// Flushes and closes the file, handing back any over-reservation.
  pub async fn finish(&mut self) -> Result<(), StorageError> {
    if let Some(mut file) = self.file.take() {
      file.flush().await?;
      file.sync_all().await?;
    }
    self.shrink_to(self.written);
    Ok(())
  }

  /// Accounts for content written behind our back, e.g. by a subprocess.
  pub async fn sync_size(&mut self) -> Result<u64, StorageError> {
    self.file.take();
    let size = tokio::fs::metadata(&self.path).await?.len();
    self.reserve(size)?;
    self.shrink_to(size);
    self.written = size;
    Ok(size)
  }

  pub async fn open(&self) -> Result<File, StorageError> {
    Ok(File::open(&self.path).await?)
  }

  fn shrink_to(&mut self, total: u64) {
    if total < self.reserved {
      self.storage.release(self.reserved - total);
      self.reserved = total;
    }
  }
}

impl Drop for StoredFile {
  fn drop(&mut self) {
    // close the handle before deleting the file
    self.file.take();

    match std::fs::remove_file(&self.path) {
      Ok(()) => debug!(path = %self.path.display(), "deleted artifact"),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
      Err(e) => {
        warn!(path = %self.path.display(), "failed to delete file: {e}")
      }
    }

    self.storage.release(self.reserved);
    self.reserved = 0;
  }
}

// leftovers from a previous run are never referenced again
fn sweep_leftovers(dir: &Path) -> Result<(), StorageError> {
  for entry in std::fs::read_dir(dir)? {
    let entry = entry?;
    let ours = entry.file_name().to_string_lossy().starts_with(FILE_PREFIX);
    if !ours || !entry.file_type()?.is_file() {
      continue;
    }

    match std::fs::remove_file(entry.path()) {
      Ok(()) => debug!(path = %entry.path().display(), "removed leftover"),
      Err(e) => warn!(
        path = %entry.path().display(),
        "failed to remove leftover: {e}"
      ),
    }
  }
  Ok(())
}

static UNSAFE_CHARS: Lazy<Regex> =
  Lazy::new(|| Regex::new(r"[^\w\s-]").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Reduces an untrusted name to word characters, spaces and hyphens.
pub fn sanitize_filename(name: &str, max_len: usize) -> String {
  let base = name
    .rsplit(|c: char| c == '/' || c == '\\')
    .next()
    .unwrap_or_default();
  let safe = UNSAFE_CHARS.replace_all(base, "");
  let safe = WHITESPACE.replace_all(&safe, " ");
  let truncated: String = safe.chars().take(max_len).collect();
  let trimmed = truncated.trim_matches(|c: char| matches!(c, ' ' | '.' | '-'));

  if trimmed.is_empty() {
    "download".to_string()
  } else {
    trimmed.to_string()
  }
}

#[cfg(test)]
mod test {
  use super::*;

  fn storage(capacity: u64) -> (tempfile::TempDir, Storage) {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::new(dir.path().join("artifacts"), capacity).unwrap();
    (dir, storage)
  }

  #[tokio::test]
  async fn test_drop_releases_bytes_and_file() {
    let (_dir, storage) = storage(1024);

    let mut file = storage.create("clip", "mp4").await.unwrap();
    file.write_chunk(&[0u8; 100]).await.unwrap();
    file.write_chunk(&[1u8; 28]).await.unwrap();
    file.finish().await.unwrap();

    assert_eq!(file.size(), 128);
    assert_eq!(storage.used_bytes(), 128);
    let path = file.path().to_owned();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 128);

    drop(file);
    assert_eq!(storage.used_bytes(), 0);
    assert!(!path.exists());
  }

  #[tokio::test]
  async fn test_capacity_is_enforced() {
    let (_dir, storage) = storage(100);

    let mut first = storage.create("a", "mp4").await.unwrap();
    first.reserve(80).unwrap();

    let mut second = storage.create("b", "mp4").await.unwrap();
    let err = second.write_chunk(&[0u8; 30]).await.unwrap_err();
    assert!(matches!(
      err,
      StorageError::Full {
        requested: 30,
        available: 20
      }
    ));

    // finishing hands back the unused part of the reservation
    first.finish().await.unwrap();
    assert_eq!(storage.used_bytes(), 0);
    second.write_chunk(&[0u8; 30]).await.unwrap();
    assert_eq!(storage.used_bytes(), 30);
  }

  #[tokio::test]
  async fn test_sync_size_after_external_write() {
    let (_dir, storage) = storage(1024);

    let mut file = storage.create("converted", "mp3").await.unwrap();
    std::fs::write(file.path(), [7u8; 300]).unwrap();

    assert_eq!(file.sync_size().await.unwrap(), 300);
    assert_eq!(storage.used_bytes(), 300);
  }

  #[tokio::test]
  async fn test_startup_only_sweeps_own_files() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"keep").unwrap();
    std::fs::create_dir(dir.path().join("relay-dir")).unwrap();

    let storage = Storage::new(dir.path(), 1024).unwrap();
    let mut file = storage.create("clip", "mp4").await.unwrap();
    file.write_chunk(&[1u8; 10]).await.unwrap();
    file.finish().await.unwrap();
    let leftover = file.path().to_owned();
    // simulate a crash: the file outlives its storage
    std::mem::forget(file);

    Storage::new(dir.path(), 1024).unwrap();

    assert!(!leftover.exists());
    assert!(dir.path().join("notes.txt").exists());
    assert!(dir.path().join("relay-dir").is_dir());
  }

  #[test]
  fn test_sanitize_filename() {
    assert_eq!(sanitize_filename("../../etc/passwd", 50), "passwd");
    assert_eq!(
      sanitize_filename("My  <Video>: part 1?", 50),
      "My Video part 1"
    );
    assert_eq!(sanitize_filename("...", 50), "download");
    assert_eq!(sanitize_filename(&"a".repeat(80), 50).len(), 50);
  }
}
