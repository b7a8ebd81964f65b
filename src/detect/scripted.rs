use anyhow::{anyhow, Context, Result};
use std::path::Path;

use super::backend::Detector;
use crate::event::DetectionRecord;
use crate::frame::Frame;

/// Replays pre-computed detections, one list per frame.
///
/// The script is JSON Lines: line `n` holds the detections for frame `n` as
/// an array of records (`[]` for an empty frame). Frames past the end of the
/// script yield nothing. Used in place of a model-backed detector for
/// replaying recorded tracker output and in tests.
pub struct ScriptedDetector {
    frames: Vec<Vec<DetectionRecord>>,
}

impl ScriptedDetector {
    pub fn new(frames: Vec<Vec<DetectionRecord>>) -> Self {
        Self { frames }
    }

    pub fn from_jsonl(text: &str) -> Result<Self> {
        let mut frames = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                frames.push(Vec::new());
                continue;
            }
            let dets: Vec<DetectionRecord> = serde_json::from_str(line)
                .map_err(|e| anyhow!("detection script line {}: {}", line_no + 1, e))?;
            frames.push(dets);
        }
        Ok(Self { frames })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read detection script {}", path.display()))?;
        Self::from_jsonl(&text)
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

impl Detector for ScriptedDetector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(&mut self, frame: &Frame, tracking: bool) -> Result<Vec<DetectionRecord>> {
        let mut dets = usize::try_from(frame.index())
            .ok()
            .and_then(|i| self.frames.get(i))
            .cloned()
            .unwrap_or_default();
        if !tracking {
            for det in &mut dets {
                det.track_id = None;
            }
        }
        Ok(dets)
    }
}
