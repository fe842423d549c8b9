pub mod image_helper {
    use crate::core_modules::labels::LabelBox;
    use image::imageops::{self, FilterType};
    use image::{ImageFormat, Rgb, RgbImage};
    use std::path::Path;

    /// The scale-and-crop applied to one source image to fill a tile.
    ///
    /// The source is resized to `scaled_width x scaled_height` (both at least
    /// the tile size) and then the centred `tile_width x tile_height` window
    /// starting at `(offset_x, offset_y)` is kept.
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct CoverFit {
        pub scaled_width: u32,
        pub scaled_height: u32,
        pub offset_x: u32,
        pub offset_y: u32,
        pub tile_width: u32,
        pub tile_height: u32,
    }

    impl CoverFit {
        pub fn new(src_width: u32, src_height: u32, tile_width: u32, tile_height: u32) -> Self {
            let src_w = src_width.max(1) as f64;
            let src_h = src_height.max(1) as f64;
            let scale = (tile_width as f64 / src_w).max(tile_height as f64 / src_h);

            let scaled_width = ((src_w * scale).round() as u32).max(tile_width);
            let scaled_height = ((src_h * scale).round() as u32).max(tile_height);

            Self {
                scaled_width,
                scaled_height,
                offset_x: (scaled_width - tile_width) / 2,
                offset_y: (scaled_height - tile_height) / 2,
                tile_width,
                tile_height,
            }
        }

        /// Maps a normalized box into tile pixels through the same resize and
        /// crop as the thumbnail. Returns inclusive `(x0, y0, x1, y1)`, clipped
        /// to the tile, or `None` when the box falls entirely in the cropped area.
        pub fn map_box(&self, b: &LabelBox) -> Option<(u32, u32, u32, u32)> {
            let (nx0, ny0, nx1, ny1) = b.corners();
            let x0 = nx0 * self.scaled_width as f64 - self.offset_x as f64;
            let x1 = nx1 * self.scaled_width as f64 - self.offset_x as f64;
            let y0 = ny0 * self.scaled_height as f64 - self.offset_y as f64;
            let y1 = ny1 * self.scaled_height as f64 - self.offset_y as f64;

            let max_x = (self.tile_width - 1) as f64;
            let max_y = (self.tile_height - 1) as f64;
            if x1 < 0.0 || y1 < 0.0 || x0 > max_x || y0 > max_y {
                return None;
            }

            Some((
                x0.round().clamp(0.0, max_x) as u32,
                y0.round().clamp(0.0, max_y) as u32,
                x1.round().clamp(0.0, max_x) as u32,
                y1.round().clamp(0.0, max_y) as u32,
            ))
        }
    }

    /// Produces a tile fully covered by `source`, with no letterboxing.
    pub fn cover_fit(source: &RgbImage, tile_width: u32, tile_height: u32) -> (RgbImage, CoverFit) {
        let fit = CoverFit::new(source.width(), source.height(), tile_width, tile_height);
        let scaled = imageops::resize(source, fit.scaled_width, fit.scaled_height, FilterType::Triangle);
        let tile = imageops::crop_imm(&scaled, fit.offset_x, fit.offset_y, tile_width, tile_height).to_image();
        (tile, fit)
    }

    /// Draws a hollow rectangle with inclusive corners, `thickness` pixels wide.
    pub fn draw_rect(image: &mut RgbImage, corners: (u32, u32, u32, u32), color: [u8; 3], thickness: u32) {
        let (x0, y0, x1, y1) = corners;
        if image.width() == 0 || image.height() == 0 {
            return;
        }
        let x1 = x1.min(image.width() - 1);
        let y1 = y1.min(image.height() - 1);
        if x0 > x1 || y0 > y1 {
            return;
        }

        let pixel = Rgb(color);
        for t in 0..thickness {
            let (top, bottom) = (y0.saturating_add(t), y1.saturating_sub(t));
            let (left, right) = (x0.saturating_add(t), x1.saturating_sub(t));
            if top > bottom || left > right {
                break;
            }
            for x in left..=right {
                image.put_pixel(x, top, pixel);
                image.put_pixel(x, bottom, pixel);
            }
            for y in top..=bottom {
                image.put_pixel(left, y, pixel);
                image.put_pixel(right, y, pixel);
            }
        }
    }

    /// Saves `image` in the format named by `extension` (`jpg`, `png`, ...).
    pub fn save(path: &Path, image: &RgbImage, extension: &str) -> Result<(), image::error::ImageError> {
        let format = ImageFormat::from_extension(extension).unwrap_or(ImageFormat::Jpeg);
        image.save_with_format(path, format)
    }
}

#[cfg(test)]
mod tests {

    use super::image_helper::*;
    use crate::core_modules::labels::LabelBox;
    use image::{Rgb, RgbImage};

    #[test]
    fn cover_fit_fills_the_tile_without_letterboxing() {
        let source = RgbImage::from_pixel(640, 480, Rgb([200, 10, 10]));
        let (tile, fit) = cover_fit(&source, 320, 180);

        assert_eq!(tile.dimensions(), (320, 180));
        assert_eq!(fit.scaled_width, 320);
        assert_eq!(fit.scaled_height, 240);
        assert_eq!((fit.offset_x, fit.offset_y), (0, 30));
        assert!(tile.pixels().all(|p| p[0] > 150));
    }

    #[test]
    fn boxes_follow_the_crop_offset() {
        // 200x100 into a 100x100 tile: no scaling, 50px cropped from each side.
        let fit = CoverFit::new(200, 100, 100, 100);
        assert_eq!((fit.scaled_width, fit.scaled_height, fit.offset_x), (200, 100, 50));

        let centred = LabelBox::normalized(0, 0.5, 0.5, 0.2, 0.5);
        assert_eq!(fit.map_box(&centred), Some((30, 25, 70, 75)));

        let cropped_away = LabelBox::normalized(0, 0.05, 0.5, 0.05, 0.1);
        assert_eq!(fit.map_box(&cropped_away), None);

        let straddling = LabelBox::normalized(0, 0.25, 0.5, 0.1, 0.1);
        let (x0, _, x1, _) = fit.map_box(&straddling).unwrap();
        assert_eq!((x0, x1), (0, 10));
    }

    #[test]
    fn matching_aspect_ratio_is_a_plain_scale() {
        let fit = CoverFit::new(640, 360, 320, 180);
        assert_eq!((fit.offset_x, fit.offset_y), (0, 0));
        let full = LabelBox::normalized(0, 0.5, 0.5, 1.0, 1.0);
        assert_eq!(fit.map_box(&full), Some((0, 0, 319, 179)));
    }

    #[test]
    fn draw_rect_outlines_without_filling() {
        let mut image = RgbImage::new(20, 20);
        draw_rect(&mut image, (2, 2, 17, 17), [255, 0, 0], 2);

        assert_eq!(image.get_pixel(2, 2), &Rgb([255, 0, 0]));
        assert_eq!(image.get_pixel(3, 10), &Rgb([255, 0, 0]));
        assert_eq!(image.get_pixel(17, 17), &Rgb([255, 0, 0]));
        assert_eq!(image.get_pixel(10, 10), &Rgb([0, 0, 0]));
        assert_eq!(image.get_pixel(1, 1), &Rgb([0, 0, 0]));
    }

    #[test]
    fn save_sheet_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = RgbImage::new(50, 30);
        let mut intensity = 0u8;
        for pixel in buffer.pixels_mut() {
            *pixel = Rgb([intensity, intensity, intensity]);
            intensity = intensity.wrapping_add(1);
        }

        let jpg = dir.path().join("gradient.jpg");
        save(&jpg, &buffer, "jpg").expect("Error Saving File.");
        let png = dir.path().join("gradient.png");
        save(&png, &buffer, "png").expect("Error Saving File.");

        assert_eq!(image::open(&png).unwrap().to_rgb8(), buffer);
        assert_eq!(image::open(&jpg).unwrap().width(), 50);
    }
}
