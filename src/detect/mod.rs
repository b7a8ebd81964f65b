mod backend;
mod filter;
mod scripted;

pub use backend::Detector;
pub use filter::{NoveltyFilter, SignificanceFilter};
pub use scripted::ScriptedDetector;
