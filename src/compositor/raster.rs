//! Raster backend on top of the `image` and `imageproc` crates.

use super::ImageBackend;
use crate::error::{CaptchaError, Result};
use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use imageproc::drawing::draw_line_segment_mut;
use std::io::Cursor;
use std::path::Path;

/// RGBA raster backend producing PNG output.
#[derive(Debug, Default, Clone, Copy)]
pub struct RasterBackend;

impl RasterBackend {
    pub fn new() -> Self {
        Self
    }
}

impl ImageBackend for RasterBackend {
    type Image = RgbaImage;
    type Color = Rgba<u8>;

    fn load(&self, path: &Path) -> Result<RgbaImage> {
        let img = image::open(path).map_err(|e| {
            CaptchaError::ImageProcessing(format!("Failed to load {}: {}", path.display(), e))
        })?;
        Ok(img.to_rgba8())
    }

    fn blank(&self, width: u32, height: u32) -> RgbaImage {
        RgbaImage::new(width, height)
    }

    fn dimensions(&self, image: &RgbaImage) -> (u32, u32) {
        image.dimensions()
    }

    fn flip_horizontal(&self, image: RgbaImage) -> RgbaImage {
        imageops::flip_horizontal(&image)
    }

    fn flip_vertical(&self, image: RgbaImage) -> RgbaImage {
        imageops::flip_vertical(&image)
    }

    fn rotate(&self, image: RgbaImage, degrees: u32) -> RgbaImage {
        match degrees % 360 {
            90 => imageops::rotate90(&image),
            180 => imageops::rotate180(&image),
            270 => imageops::rotate270(&image),
            _ => image,
        }
    }

    fn resize(&self, image: RgbaImage, width: u32, height: u32) -> RgbaImage {
        imageops::resize(&image, width, height, FilterType::Triangle)
    }

    fn color(&self, rgb: [u8; 3]) -> Rgba<u8> {
        Rgba([rgb[0], rgb[1], rgb[2], 255])
    }

    fn draw_line(&self, canvas: &mut RgbaImage, from: (u32, u32), to: (u32, u32), color: Rgba<u8>) {
        draw_line_segment_mut(
            canvas,
            (from.0 as f32, from.1 as f32),
            (to.0 as f32, to.1 as f32),
            color,
        );
    }

    fn composite(&self, canvas: &mut RgbaImage, image: &RgbaImage, x: u32, y: u32) {
        imageops::overlay(canvas, image, i64::from(x), i64::from(y));
    }

    fn encode(&self, image: &RgbaImage) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgba8(image.clone())
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        Ok(bytes)
    }
}
