//! Decoded frames and snapshot annotation.
//!
//! A `Frame` owns one decoded RGB image from a source. Annotation never
//! mutates the frame: `annotated` draws boxes and labels on a copy, which is
//! what snapshots are written from.

use image::{Rgb, RgbImage};

use crate::event::DetectionRecord;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const LABEL_BG: Rgb<u8> = Rgb([0, 0, 0]);
const BOX_THICKNESS: i32 = 2;

const GLYPH_W: i32 = 5;
const GLYPH_H: i32 = 7;
const GLYPH_SCALE: i32 = 2;
const GLYPH_ADVANCE: i32 = (GLYPH_W + 1) * GLYPH_SCALE;
const LABEL_PAD: i32 = 2;

/// One decoded frame.
pub struct Frame {
    index: u64,
    image: RgbImage,
}

impl Frame {
    pub fn new(index: u64, image: RgbImage) -> Self {
        Self { index, image }
    }

    /// Zero-based position of this frame in its source.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Copy of the frame with every detection boxed and labelled.
    pub fn annotated(&self, detections: &[DetectionRecord]) -> RgbImage {
        let mut canvas = self.image.clone();
        for det in detections {
            draw_box(&mut canvas, det);
            let label = detection_label(det);
            let label_h = GLYPH_H * GLYPH_SCALE + LABEL_PAD * 2;
            let above = det.bbox.y1.saturating_sub(10 + label_h);
            let y = if above >= 0 {
                above + LABEL_PAD
            } else {
                det.bbox.y2.saturating_add(LABEL_PAD + 2)
            };
            draw_label(&mut canvas, &label, det.bbox.x1, y);
        }
        canvas
    }
}

/// `ID:<track> <class>:<confidence>`, with the id part omitted when untracked.
pub fn detection_label(det: &DetectionRecord) -> String {
    let track = det
        .track_id
        .map(|id| format!("ID:{} ", id))
        .unwrap_or_default();
    format!("{}{}:{:.2}", track, det.class_name, det.confidence)
}

/// Fills the inclusive rectangle, clipped to the canvas.
fn fill_rect(canvas: &mut RgbImage, x1: i32, y1: i32, x2: i32, y2: i32, color: Rgb<u8>) {
    let (w, h) = (i64::from(canvas.width()), i64::from(canvas.height()));
    let (x1, x2) = (i64::from(x1).max(0), i64::from(x2).min(w - 1));
    let (y1, y2) = (i64::from(y1).max(0), i64::from(y2).min(h - 1));
    for y in y1..=y2 {
        for x in x1..=x2 {
            canvas.put_pixel(x as u32, y as u32, color);
        }
    }
}

fn draw_box(canvas: &mut RgbImage, det: &DetectionRecord) {
    let b = det.bbox;
    let t = BOX_THICKNESS - 1;
    fill_rect(canvas, b.x1, b.y1, b.x2, b.y1.saturating_add(t), BOX_COLOR);
    fill_rect(canvas, b.x1, b.y2.saturating_sub(t), b.x2, b.y2, BOX_COLOR);
    fill_rect(canvas, b.x1, b.y1, b.x1.saturating_add(t), b.y2, BOX_COLOR);
    fill_rect(canvas, b.x2.saturating_sub(t), b.y1, b.x2, b.y2, BOX_COLOR);
}

fn draw_label(canvas: &mut RgbImage, text: &str, x: i32, y: i32) {
    let width = text.chars().count() as i32 * GLYPH_ADVANCE;
    fill_rect(
        canvas,
        x.saturating_sub(LABEL_PAD),
        y.saturating_sub(LABEL_PAD),
        x.saturating_add(width + LABEL_PAD),
        y.saturating_add(GLYPH_H * GLYPH_SCALE + LABEL_PAD),
        LABEL_BG,
    );
    let mut cx = x;
    for ch in text.chars() {
        if i64::from(cx) >= i64::from(canvas.width()) {
            break;
        }
        if let Some(rows) = glyph(ch) {
            for (row, bits) in rows.iter().enumerate() {
                for col in 0..GLYPH_W {
                    if (bits >> (GLYPH_W - 1 - col)) & 1 == 1 {
                        let px = cx.saturating_add(col * GLYPH_SCALE);
                        let py = y.saturating_add(row as i32 * GLYPH_SCALE);
                        fill_rect(
                            canvas,
                            px,
                            py,
                            px.saturating_add(GLYPH_SCALE - 1),
                            py.saturating_add(GLYPH_SCALE - 1),
                            BOX_COLOR,
                        );
                    }
                }
            }
        }
        cx = cx.saturating_add(GLYPH_ADVANCE);
    }
}

/// 5x7 glyphs. Letters render in upper case.
fn glyph(ch: char) -> Option<[u8; 7]> {
    let rows = match ch.to_ascii_uppercase() {
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x1E],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x11, 0x0A, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        '_' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1F],
        _ => return None,
    };
    Some(rows)
}
