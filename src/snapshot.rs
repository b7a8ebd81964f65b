use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use image::RgbImage;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

const MAX_NAME_ATTEMPTS: u32 = 100;

/// Writes annotated snapshots as JPEG files under one root directory.
#[derive(Clone, Debug)]
pub struct SnapshotWriter {
    root: PathBuf,
}

impl SnapshotWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `snapshot_<source>_<YYYYMMDD_HHMMSS_mmm>.jpg`
    pub fn file_name(source_id: &str, timestamp: DateTime<Utc>) -> String {
        format!("{}.jpg", Self::file_stem(source_id, timestamp))
    }

    fn file_stem(source_id: &str, timestamp: DateTime<Utc>) -> String {
        format!(
            "snapshot_{}_{}",
            sanitize_source_id(source_id),
            timestamp.format("%Y%m%d_%H%M%S_%3f")
        )
    }

    /// Writes the JPEG under a fresh name. A name already taken within the
    /// same millisecond gets a `_<n>` suffix; existing files are never
    /// overwritten.
    pub fn write(
        &self,
        source_id: &str,
        timestamp: DateTime<Utc>,
        image: &RgbImage,
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create snapshot dir {}", self.root.display()))?;
        let (path, file) = self.create_unique(&Self::file_stem(source_id, timestamp))?;
        let mut out = BufWriter::new(file);
        let written = image
            .write_to(&mut out, image::ImageFormat::Jpeg)
            .map_err(anyhow::Error::from)
            .and_then(|()| out.flush().map_err(anyhow::Error::from));
        if let Err(err) = written {
            let _ = std::fs::remove_file(&path);
            return Err(err.context(format!("failed to write snapshot {}", path.display())));
        }
        Ok(path)
    }

    fn create_unique(&self, stem: &str) -> Result<(PathBuf, File)> {
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = match attempt {
                0 => format!("{}.jpg", stem),
                n => format!("{}_{}.jpg", stem, n),
            };
            let path = self.root.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("failed to create snapshot {}", path.display()))
                }
            }
        }
        Err(anyhow!(
            "no free snapshot name for {} after {} attempts",
            stem,
            MAX_NAME_ATTEMPTS
        ))
    }
}

/// MIME type for an image file name, by extension.
pub fn content_type_for(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

/// Replaces characters outside `[A-Za-z0-9_-]` with `_`, capped at 64 chars.
pub fn sanitize_source_id(source_id: &str) -> String {
    let out: String = source_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect();
    if out.is_empty() {
        "source".to_string()
    } else {
        out
    }
}
