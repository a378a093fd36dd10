//!
//! src/capture.rs  Andrew Belles  Oct 17th, 2026
//!
//! Audio capture seam. The recorder only ever talks to an AudioSource;
//! the terminal build replays clips from a directory in place of a mic
//!

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::CaptureConfig;
use crate::errors::SetListError;

/// One captured chunk, ready to be submitted for recognition
#[derive(Debug, Clone)]
pub struct AudioClip {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub mime: String,
    pub captured_at: DateTime<Utc>
}

/// A capture in progress. Exactly one is alive at a time.
#[async_trait]
pub trait CaptureHandle: Send {
    /// Stops capturing and hands back what was recorded
    async fn finish(self: Box<Self>) -> Result<AudioClip, SetListError>;

    /// Stops capturing and unloads without producing a clip
    async fn discard(self: Box<Self>);
}

#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Acquire the capture device and start recording. Failing to acquire
    /// is DeviceUnavailable.
    async fn begin(&self, opts: &CaptureConfig) -> Result<Box<dyn CaptureHandle>, SetListError>;
}

fn mime_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref() {
        Some("wav") => "audio/wav",
        Some("mp3") => "audio/mpeg",
        Some("m4a") | Some("aac") | Some("mp4") => "audio/mp4",
        Some("ogg") => "audio/ogg",
        Some("flac") => "audio/flac",
        _ => "application/octet-stream"
    }
}

///
/// Replays audio files from a directory, one per capture, cycling
///
#[derive(Debug)]
pub struct ClipDirSource {
    clips: Vec<PathBuf>,
    next: AtomicUsize
}

impl ClipDirSource {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, SetListError> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir).map_err(|e|
            SetListError::DeviceUnavailable(format!("read {}: {e}", dir.display()))
        )?;

        let mut clips: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && mime_for(p) != "application/octet-stream")
            .collect();
        clips.sort();

        if clips.is_empty() {
            return Err(SetListError::DeviceUnavailable(
                format!("no audio clips in {}", dir.display())
            ));
        }
        Ok( Self { clips, next: AtomicUsize::new(0) } )
    }

    pub fn len(&self) -> usize {
        self.clips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clips.is_empty()
    }
}

struct FileCapture {
    path: PathBuf,
    started_at: DateTime<Utc>
}

#[async_trait]
impl CaptureHandle for FileCapture {
    async fn finish(self: Box<Self>) -> Result<AudioClip, SetListError> {
        let bytes = tokio::fs::read(&self.path).await?;
        let file_name = self.path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("sample")
            .to_string();
        Ok( AudioClip {
            bytes,
            file_name,
            mime: mime_for(&self.path).to_string(),
            captured_at: self.started_at
        })
    }

    async fn discard(self: Box<Self>) {
        debug!(path = %self.path.display(), "capture.discard");
    }
}

#[async_trait]
impl AudioSource for ClipDirSource {
    async fn begin(&self, opts: &CaptureConfig) -> Result<Box<dyn CaptureHandle>, SetListError> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.clips.len();
        let path = self.clips[index].clone();
        if !path.is_file() {
            return Err(SetListError::DeviceUnavailable(
                format!("clip vanished: {}", path.display())
            ));
        }
        debug!(
            path = %path.display(),
            sample_rate = opts.sample_rate,
            channels = opts.channels,
            "capture.begin"
        );
        Ok(Box::new(FileCapture { path, started_at: Utc::now() }))
    }
}
