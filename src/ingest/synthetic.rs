use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};

use super::FrameSource;
use crate::frame::Frame;

const DEFAULT_FRAMES: u64 = 100;
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;

/// Settings for `stub://` sources.
#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub name: String,
    pub frames: u64,
    pub width: u32,
    pub height: u32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "stub".to_string(),
            frames: DEFAULT_FRAMES,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
        }
    }
}

impl SyntheticConfig {
    /// Parses `stub://<name>?frames=N&width=W&height=H`.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix("stub://")
            .ok_or_else(|| anyhow!("not a stub uri: {}", uri))?;
        let (name, query) = rest.split_once('?').unwrap_or((rest, ""));
        let mut cfg = Self {
            name: if name.is_empty() { "stub".to_string() } else { name.to_string() },
            ..Self::default()
        };
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed stub parameter '{}'", pair))?;
            match key {
                "frames" => cfg.frames = parse_param(key, value)?,
                "width" => cfg.width = parse_param(key, value)?,
                "height" => cfg.height = parse_param(key, value)?,
                other => return Err(anyhow!("unknown stub parameter '{}'", other)),
            }
        }
        if cfg.width == 0 || cfg.height == 0 {
            return Err(anyhow!("stub frame dimensions must be non-zero"));
        }
        Ok(cfg)
    }
}

fn parse_param<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("stub parameter '{}' has invalid value '{}'", key, value))
}

/// Finite stream of generated frames with a slowly shifting gradient.
pub struct SyntheticSource {
    config: SyntheticConfig,
    produced: u64,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        log::info!(
            "synthetic source {}: {} frames at {}x{}",
            config.name,
            config.frames,
            config.width,
            config.height
        );
        Self {
            config,
            produced: 0,
        }
    }
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.produced >= self.config.frames {
            return Ok(None);
        }
        let index = self.produced;
        self.produced += 1;
        let shift = (index % 256) as u32;
        let image = RgbImage::from_fn(self.config.width, self.config.height, |x, y| {
            let v = ((x + y + shift) % 256) as u8;
            Rgb([v, v / 2, 255 - v])
        });
        Ok(Some(Frame::new(index, image)))
    }

    fn describe(&self) -> String {
        format!("stub://{}", self.config.name)
    }
}
