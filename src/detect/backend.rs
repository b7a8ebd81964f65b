use anyhow::Result;

use crate::event::DetectionRecord;
use crate::frame::Frame;

/// Object detector/tracker.
///
/// The detection engine itself lives outside this crate. Implementations wrap
/// it and report, per frame, the objects it found. With `tracking` enabled a
/// detector is stateful across frames and assigns stable `track_id`s to the
/// same physical object; with it disabled every `track_id` is `None`.
pub trait Detector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on one frame.
    fn detect(&mut self, frame: &Frame, tracking: bool) -> Result<Vec<DetectionRecord>>;

    /// Optional warm-up hook, called once before the first frame.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
