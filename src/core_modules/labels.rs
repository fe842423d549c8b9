// THEORY:
// The `labels` module turns YOLO-style label files into `LabelBox` values.
// A label line is `cls xc yc w h`, with the four geometry values expressed as
// fractions of the image size. The module is a "dumb" data layer: it parses,
// clamps and serializes, but knows nothing about thumbnails or pixels.
//
// A malformed file never aborts a capture. Callers receive a `Validation`
// error, log it, and store the record with zero boxes.

use crate::error::{CaptureError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Fixed class palette, indexed by `cls % PALETTE.len()`.
pub const PALETTE: [[u8; 3]; 12] = [
    [0xff, 0x3b, 0x30],
    [0xff, 0x95, 0x00],
    [0xff, 0xcc, 0x00],
    [0x34, 0xc7, 0x59],
    [0x00, 0xc7, 0xbe],
    [0x30, 0xb0, 0xff],
    [0x00, 0x7a, 0xff],
    [0x58, 0x56, 0xd6],
    [0xaf, 0x52, 0xde],
    [0xff, 0x2d, 0x55],
    [0x64, 0xd2, 0xff],
    [0xff, 0xd6, 0x0a],
];

/// A normalized bounding box. All four geometry values lie in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabelBox {
    /// Class id.
    pub cls: u32,
    /// Center x.
    pub xc: f64,
    /// Center y.
    pub yc: f64,
    pub w: f64,
    pub h: f64,
}

impl LabelBox {
    /// Builds a box with every coordinate clamped into `[0, 1]`.
    pub fn normalized(cls: u32, xc: f64, yc: f64, w: f64, h: f64) -> Self {
        Self {
            cls,
            xc: clamp_unit(xc),
            yc: clamp_unit(yc),
            w: clamp_unit(w),
            h: clamp_unit(h),
        }
    }

    pub fn color(&self) -> [u8; 3] {
        PALETTE[self.cls as usize % PALETTE.len()]
    }

    /// Corners as fractions of the image: `(x0, y0, x1, y1)`.
    pub fn corners(&self) -> (f64, f64, f64, f64) {
        (
            self.xc - self.w / 2.0,
            self.yc - self.h / 2.0,
            self.xc + self.w / 2.0,
            self.yc + self.h / 2.0,
        )
    }
}

fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

/// Parses the text of one label file. `path` is only used for error reports.
pub fn parse_labels(text: &str, path: &Path) -> Result<Vec<LabelBox>> {
    let mut boxes = Vec::new();

    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let invalid = |message: String| CaptureError::Validation {
            path: path.to_path_buf(),
            line: index + 1,
            message,
        };

        let fields: Vec<&str> = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|f| !f.is_empty())
            .collect();
        if fields.len() != 5 {
            return Err(invalid(format!("expected 5 fields, found {}", fields.len())));
        }

        let cls = parse_class(fields[0]).ok_or_else(|| invalid(format!("bad class id '{}'", fields[0])))?;

        let mut geometry = [0.0f64; 4];
        for (slot, field) in geometry.iter_mut().zip(&fields[1..]) {
            let value: f64 = field
                .parse()
                .map_err(|_| invalid(format!("bad coordinate '{field}'")))?;
            if !value.is_finite() {
                return Err(invalid(format!("non-finite coordinate '{field}'")));
            }
            *slot = value;
        }

        let [xc, yc, w, h] = geometry;
        boxes.push(LabelBox::normalized(cls, xc, yc, w, h));
    }

    Ok(boxes)
}

/// Class ids are integers, but some exporters write them as `3.0`.
fn parse_class(field: &str) -> Option<u32> {
    if let Ok(v) = field.parse::<u32>() {
        return Some(v);
    }
    let v: f64 = field.parse().ok()?;
    (v.is_finite() && v >= 0.0 && v.fract() == 0.0 && v <= u32::MAX as f64).then_some(v as u32)
}

/// Reads a label file. A missing file is not an error and yields no boxes.
pub fn read_label_file(path: &Path) -> Result<Vec<LabelBox>> {
    match std::fs::read_to_string(path) {
        Ok(text) => parse_labels(&text, path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(CaptureError::io(path, e)),
    }
}

pub fn boxes_to_json(boxes: &[LabelBox]) -> Result<String> {
    Ok(serde_json::to_string(boxes)?)
}

/// Parses stored boxes, re-clamping in case the column was edited by hand.
pub fn boxes_from_json(json: &str) -> Result<Vec<LabelBox>> {
    let raw: Vec<LabelBox> = serde_json::from_str(json)?;
    Ok(raw
        .into_iter()
        .map(|b| LabelBox::normalized(b.cls, b.xc, b.yc, b.w, b.h))
        .collect())
}
