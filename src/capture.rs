//! Frame sources. Screenshots themselves come from an external tool that
//! keeps overwriting one image file; this module only reads it.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};

use crate::detection::{Frame, TextRecognizer};

/// Blocking frame source; the worker calls it on the blocking pool.
pub trait CaptureProvider: Send + Sync {
    fn capture(&self) -> Result<Frame>;
}

pub struct FileCapture {
    path: PathBuf,
}

impl FileCapture {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CaptureProvider for FileCapture {
    fn capture(&self) -> Result<Frame> {
        let modified = fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .with_context(|| format!("capture file {} unavailable", self.path.display()))?;

        let image = image::open(&self.path)
            .with_context(|| format!("failed to decode capture {}", self.path.display()))?;
        if image.width() == 0 || image.height() == 0 {
            bail!("capture {} is empty", self.path.display());
        }

        Ok(Frame::from_dynamic(&image, DateTime::<Utc>::from(modified)))
    }
}

/// Reads text that an external OCR tool writes next to the capture
/// (`latest.png` -> `latest.txt`).
pub struct SidecarTextRecognizer {
    path: PathBuf,
}

impl SidecarTextRecognizer {
    pub fn for_capture(capture_path: &Path) -> Self {
        Self {
            path: capture_path.with_extension("txt"),
        }
    }
}

impl TextRecognizer for SidecarTextRecognizer {
    fn recognize(&self, _frame: &Frame) -> Result<String> {
        fs::read_to_string(&self.path)
            .with_context(|| format!("no recognised text at {}", self.path.display()))
    }
}
