// THEORY:
// The `LayerBundler` turns the stored records of one layer into a browsable
// artifact: a folder of image copies, one contact sheet, and a `.done` marker.
// It is a pure function of the store. Running it twice over the same records
// rewrites the same files, so it can be called after every session and again on
// demand without coordination.
//
// Key architectural principles:
// 1.  **Derived, never authoritative**: nothing here is read back by the core.
//     Deleting a bundle loses nothing that the store cannot regenerate.
// 2.  **Chronological tiles**: record `i` (oldest first) is drawn in tile `i`,
//     row-major. Any visual re-ordering belongs to the display, not the archive.
// 3.  **One transform**: each thumbnail is a cover fit, and its boxes are mapped
//     through the exact `CoverFit` that produced it, crop offset included.
// 4.  **Marker always lands**: per-file failures are logged and skipped, and a
//     failed sheet still gets its `.done` marker, so a finalized layer never
//     depends on rendering succeeding.

use crate::config::CaptureConfig;
use crate::core_modules::capture_store::{CaptureRecord, CaptureStore, RecordOrder};
use crate::core_modules::dataset::LayerId;
use crate::core_modules::utils::image_helper::image_helper::{self, cover_fit};
use crate::error::{CaptureError, Result};
use image::{Rgb, RgbImage};
use serde::Serialize;
use std::path::PathBuf;

pub const DONE_MARKER: &str = ".done";
const BOX_THICKNESS: u32 = 2;

/// Sheet geometry, copied out of the configuration.
#[derive(Debug, Clone)]
pub struct SheetLayout {
    pub rows: u32,
    pub cols: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub gap: u32,
    pub extension: String,
}

impl SheetLayout {
    pub fn from_config(config: &CaptureConfig) -> Self {
        Self {
            rows: config.grid_rows,
            cols: config.grid_cols,
            tile_width: config.tile_width,
            tile_height: config.tile_height,
            gap: config.grid_gap,
            extension: config.sheet_extension.clone(),
        }
    }

    pub fn capacity(&self) -> usize {
        (self.rows * self.cols) as usize
    }

    pub fn sheet_size(&self) -> (u32, u32) {
        (
            self.cols * self.tile_width + self.cols.saturating_sub(1) * self.gap,
            self.rows * self.tile_height + self.rows.saturating_sub(1) * self.gap,
        )
    }

    /// Top-left pixel of tile `index`, row-major.
    pub fn tile_origin(&self, index: usize) -> (u32, u32) {
        let row = index as u32 / self.cols;
        let col = index as u32 % self.cols;
        (
            col * (self.tile_width + self.gap),
            row * (self.tile_height + self.gap),
        )
    }
}

/// What one bundling pass produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleReport {
    pub layer: LayerId,
    pub records: usize,
    /// Images newly copied into the bundle folder on this pass.
    pub copied: usize,
    /// Thumbnails placed on the sheet.
    pub depicted: usize,
    pub sheet: Option<PathBuf>,
    pub marker: PathBuf,
}

#[derive(Serialize)]
struct Marker<'a> {
    layer: LayerId,
    records: usize,
    depicted: usize,
    sheet: Option<&'a str>,
}

/// Builds per-layer bundles under the archive root.
#[derive(Debug, Clone)]
pub struct LayerBundler {
    store: CaptureStore,
    archive_root: PathBuf,
    layout: SheetLayout,
}

impl LayerBundler {
    /// Bundles live under the store's archive root.
    pub fn new(store: CaptureStore, layout: SheetLayout) -> Self {
        Self {
            archive_root: store.archive_root().to_path_buf(),
            store,
            layout,
        }
    }

    pub fn bundle_dir(&self, layer: LayerId) -> PathBuf {
        layer.bundle_dir(&self.archive_root)
    }

    pub fn sheet_path(&self, layer: LayerId) -> PathBuf {
        self.bundle_dir(layer)
            .join(format!("{}.{}", layer.dir_name(), self.layout.extension))
    }

    pub fn marker_path(&self, layer: LayerId) -> PathBuf {
        self.bundle_dir(layer).join(DONE_MARKER)
    }

    pub fn is_finalized(&self, layer: LayerId) -> bool {
        self.marker_path(layer).is_file()
    }

    /// Runs one bundling pass for `layer`. Blocking; call from a blocking context.
    pub fn bundle(&self, layer: LayerId) -> Result<BundleReport> {
        let records = self.store.query_by_layer(Some(layer), RecordOrder::OldestFirst, None)?;
        let dir = self.bundle_dir(layer);
        std::fs::create_dir_all(&dir).map_err(|e| CaptureError::io(&dir, e))?;

        let mut report = BundleReport {
            layer,
            records: records.len(),
            copied: 0,
            depicted: 0,
            sheet: None,
            marker: self.marker_path(layer),
        };

        if records.is_empty() {
            tracing::info!(layer = %layer, "no records for layer, writing marker only");
            self.write_marker(&report)?;
            return Ok(report);
        }

        report.copied = self.copy_images(layer, &records);

        let (sheet, depicted) = self.compose_sheet(&records);
        report.depicted = depicted;
        let sheet_path = self.sheet_path(layer);
        match image_helper::save(&sheet_path, &sheet, &self.layout.extension) {
            Ok(()) => report.sheet = Some(sheet_path),
            Err(e) => tracing::error!(layer = %layer, error = %e, "failed to save contact sheet"),
        }

        self.write_marker(&report)?;
        tracing::info!(
            layer = %layer,
            records = report.records,
            copied = report.copied,
            depicted = report.depicted,
            "layer bundled"
        );
        Ok(report)
    }

    /// Copies each record's image into `layer_<N>/images/` unless already there.
    fn copy_images(&self, layer: LayerId, records: &[CaptureRecord]) -> usize {
        let images_dir = self.bundle_dir(layer).join("images");
        if let Err(e) = std::fs::create_dir_all(&images_dir) {
            tracing::warn!(dir = ?images_dir, error = %e, "cannot create bundle image folder");
            return 0;
        }

        let mut copied = 0;
        for record in records {
            let Some(name) = record.path.file_name() else {
                tracing::warn!(id = record.id, path = ?record.path, "record path has no file name");
                continue;
            };
            let dest = images_dir.join(name);
            if dest.exists() {
                continue;
            }
            match std::fs::copy(&record.path, &dest) {
                Ok(_) => copied += 1,
                Err(e) => tracing::warn!(id = record.id, path = ?record.path, error = %e, "skipping missing capture"),
            }
        }
        copied
    }

    /// Renders up to `rows * cols` records onto a blank sheet. Returns the sheet
    /// and the number of tiles actually filled.
    fn compose_sheet(&self, records: &[CaptureRecord]) -> (RgbImage, usize) {
        let (width, height) = self.layout.sheet_size();
        let mut sheet = RgbImage::from_pixel(width, height, Rgb([0, 0, 0]));
        let mut depicted = 0;

        for (index, record) in records.iter().take(self.layout.capacity()).enumerate() {
            let source = match image::open(&record.path) {
                Ok(img) => img.to_rgb8(),
                Err(e) => {
                    tracing::warn!(id = record.id, path = ?record.path, error = %e, "unreadable capture, leaving tile empty");
                    continue;
                }
            };

            let (mut tile, fit) = cover_fit(&source, self.layout.tile_width, self.layout.tile_height);
            for b in &record.boxes {
                if let Some(corners) = fit.map_box(b) {
                    image_helper::draw_rect(&mut tile, corners, b.color(), BOX_THICKNESS);
                }
            }

            let (x, y) = self.layout.tile_origin(index);
            image::imageops::replace(&mut sheet, &tile, x as i64, y as i64);
            depicted += 1;
        }

        (sheet, depicted)
    }

    fn write_marker(&self, report: &BundleReport) -> Result<()> {
        let sheet_name = report
            .sheet
            .as_ref()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str());
        let marker = Marker {
            layer: report.layer,
            records: report.records,
            depicted: report.depicted,
            sheet: sheet_name,
        };
        let body = serde_json::to_string_pretty(&marker)?;
        std::fs::write(&report.marker, body).map_err(|e| CaptureError::io(&report.marker, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::capture_store::NewCapture;
    use crate::core_modules::dataset::Split;
    use crate::core_modules::labels::LabelBox;
    use chrono::{Duration, Utc};

    struct Fixture {
        _dir: tempfile::TempDir,
        archive: PathBuf,
        store: CaptureStore,
        bundler: LayerBundler,
    }

    fn layout() -> SheetLayout {
        SheetLayout {
            rows: 2,
            cols: 2,
            tile_width: 40,
            tile_height: 20,
            gap: 0,
            extension: "png".to_string(),
        }
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("archive");
        let dataset = dir.path().join("dataset");
        std::fs::create_dir_all(&archive).unwrap();
        let store = CaptureStore::open(&dir.path().join("c.db"), &archive, &dataset).unwrap();
        let bundler = LayerBundler::new(store.clone(), layout());
        Fixture {
            _dir: dir,
            archive,
            store,
            bundler,
        }
    }

    /// Stores `colors.len()` solid-colour captures in layer 1, one second apart.
    fn seed(f: &Fixture, colors: &[[u8; 3]], boxes: Vec<LabelBox>) {
        let t0 = Utc::now();
        let dir = LayerId(1).captures_dir(&f.archive);
        std::fs::create_dir_all(&dir).unwrap();
        for (i, color) in colors.iter().enumerate() {
            let path = dir.join(format!("{i:02}.png"));
            RgbImage::from_pixel(80, 40, Rgb(*color)).save(&path).unwrap();
            f.store
                .append(&NewCapture {
                    path,
                    layer: LayerId(1),
                    split: Split::Train,
                    ts: t0 + Duration::seconds(i as i64),
                    src_path: PathBuf::from("train/images/x.png"),
                    boxes: boxes.clone(),
                })
                .unwrap();
        }
    }

    #[test]
    fn layout_places_tiles_row_major() {
        let layout = SheetLayout { gap: 4, ..layout() };
        assert_eq!(layout.sheet_size(), (84, 44));
        assert_eq!(layout.tile_origin(0), (0, 0));
        assert_eq!(layout.tile_origin(1), (44, 0));
        assert_eq!(layout.tile_origin(2), (0, 24));
    }

    #[test]
    fn empty_layer_gets_only_a_marker() {
        let f = fixture();
        let report = f.bundler.bundle(LayerId(5)).unwrap();

        assert_eq!(report.records, 0);
        assert!(report.sheet.is_none());
        assert!(f.bundler.is_finalized(LayerId(5)));
        assert!(!f.bundler.sheet_path(LayerId(5)).exists());
    }

    #[test]
    fn sheet_tiles_follow_capture_order() {
        let f = fixture();
        let colors = [[255, 0, 0], [0, 255, 0], [0, 0, 255], [255, 255, 0], [255, 255, 255]];
        seed(&f, &colors, Vec::new());

        let report = f.bundler.bundle(LayerId(1)).unwrap();
        assert_eq!(report.records, 5);
        assert_eq!(report.copied, 5);
        assert_eq!(report.depicted, 4);

        let sheet = image::open(report.sheet.as_ref().unwrap()).unwrap().to_rgb8();
        assert_eq!(sheet.dimensions(), (80, 40));
        // centre pixel of each tile, row-major
        assert_eq!(sheet.get_pixel(20, 10), &Rgb([255, 0, 0]));
        assert_eq!(sheet.get_pixel(60, 10), &Rgb([0, 255, 0]));
        assert_eq!(sheet.get_pixel(20, 30), &Rgb([0, 0, 255]));
        assert_eq!(sheet.get_pixel(60, 30), &Rgb([255, 255, 0]));

        let images = f.bundler.bundle_dir(LayerId(1)).join("images");
        assert_eq!(std::fs::read_dir(images).unwrap().count(), 5);
    }

    #[test]
    fn boxes_are_drawn_in_class_colour() {
        let f = fixture();
        let b = LabelBox::normalized(0, 0.5, 0.5, 0.5, 0.5);
        seed(&f, &[[0, 0, 0]], vec![b]);

        let report = f.bundler.bundle(LayerId(1)).unwrap();
        let sheet = image::open(report.sheet.unwrap()).unwrap().to_rgb8();

        // 80x40 source into a 40x20 tile is a plain half scale: box spans 10..30 x 5..15.
        assert_eq!(sheet.get_pixel(10, 5), &Rgb(b.color()));
        assert_eq!(sheet.get_pixel(20, 10), &Rgb([0, 0, 0]));
    }

    #[test]
    fn rebundling_is_idempotent() {
        let f = fixture();
        seed(&f, &[[10, 20, 30], [40, 50, 60]], Vec::new());

        let first = f.bundler.bundle(LayerId(1)).unwrap();
        let sheet_a = std::fs::read(first.sheet.as_ref().unwrap()).unwrap();
        let marker_a = std::fs::read_to_string(&first.marker).unwrap();

        let second = f.bundler.bundle(LayerId(1)).unwrap();
        assert_eq!(second.copied, 0);
        assert_eq!(second.depicted, first.depicted);
        assert_eq!(std::fs::read(second.sheet.as_ref().unwrap()).unwrap(), sheet_a);
        assert_eq!(std::fs::read_to_string(&second.marker).unwrap(), marker_a);
    }

    #[test]
    fn missing_files_are_skipped_but_marker_is_written() {
        let f = fixture();
        seed(&f, &[[1, 2, 3], [4, 5, 6]], Vec::new());
        std::fs::remove_file(LayerId(1).captures_dir(&f.archive).join("00.png")).unwrap();

        let report = f.bundler.bundle(LayerId(1)).unwrap();
        assert_eq!(report.records, 2);
        assert_eq!(report.copied, 1);
        assert_eq!(report.depicted, 1);
        assert!(report.marker.is_file());

        let sheet = image::open(report.sheet.unwrap()).unwrap().to_rgb8();
        assert_eq!(sheet.get_pixel(20, 10), &Rgb([0, 0, 0]));
        assert_eq!(sheet.get_pixel(60, 10), &Rgb([4, 5, 6]));
    }
}
