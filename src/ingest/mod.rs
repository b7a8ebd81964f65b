//! Frame sources.
//!
//! Video decoding lives outside this crate; a source only has to hand out
//! decoded frames in order. Two sources ship with the crate:
//! - `stub://<name>?frames=N`: synthetic frames for tests and dry runs
//! - a local directory of JPEG/PNG images, read in file-name order
//!
//! Opening a source is the only fallible step that is fatal to a worker.
//! `next_frame` returning `Ok(None)` is a clean end of stream.

mod image_dir;
mod synthetic;

use anyhow::{anyhow, Result};
use std::path::Path;

use crate::frame::Frame;

pub use image_dir::ImageDirSource;
pub use synthetic::{SyntheticConfig, SyntheticSource};

/// Ordered supply of decoded frames for one worker.
pub trait FrameSource: Send {
    /// Next frame, or `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// Opens the source named by `uri`.
pub fn open_source(uri: &str) -> Result<Box<dyn FrameSource>> {
    let uri = uri.trim();
    if uri.is_empty() {
        return Err(anyhow!("empty source uri"));
    }
    if uri.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(SyntheticConfig::from_uri(uri)?)));
    }
    if let Some((scheme, _)) = uri.split_once("://") {
        return Err(anyhow!("unsupported source scheme '{}' in {}", scheme, uri));
    }
    Ok(Box::new(ImageDirSource::open(Path::new(uri))?))
}

/// Source identifier used on events: `video_<stem>`.
///
/// `stub://front?frames=3` becomes `video_front`, `/data/videos/video2` and
/// `/data/videos/video2.mp4` both become `video_video2`.
pub fn derive_source_id(uri: &str) -> String {
    let uri = uri.trim();
    let stem = match uri.strip_prefix("stub://") {
        Some(rest) => rest.split('?').next().unwrap_or(rest).to_string(),
        None => Path::new(uri.trim_end_matches(['/', '\\']))
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default(),
    };
    let stem = if stem.is_empty() { "source".to_string() } else { stem };
    format!("video_{}", stem)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_id_from_uri() {
        assert_eq!(derive_source_id("stub://front?frames=3"), "video_front");
        assert_eq!(derive_source_id("data/videos/video2.mp4"), "video_video2");
        assert_eq!(derive_source_id("/data/videos/video2/"), "video_video2");
        assert_eq!(derive_source_id("stub://"), "video_source");
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let err = open_source("rtsp://camera/stream").err().unwrap();
        assert!(err.to_string().contains("unsupported source scheme"));
    }

    #[test]
    fn missing_directory_fails_to_open() {
        assert!(open_source("/definitely/not/here").is_err());
    }
}
