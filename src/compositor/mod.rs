//! Challenge image composition.
//!
//! The compositor only decides *where* and *how* icons are drawn; pixels are
//! pushed by an [`ImageBackend`]. [`RasterBackend`] is the bundled
//! implementation on top of `image`/`imageproc`.

mod raster;

pub use raster::RasterBackend;

use crate::config::ChallengeOptions;
use crate::error::{CaptchaError, Result};
use base64::{engine::general_purpose, Engine as _};
use rand::Rng;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Canvas width of the reference layout.
pub const CANVAS_WIDTH: u32 = 320;
/// Canvas height of the reference layout; clicks below this are invalid.
pub const CANVAS_HEIGHT: u32 = 50;

/// Largest edge an icon may have for a given icon count.
pub fn icon_size(icon_count: u32) -> u32 {
    match icon_count {
        0..=5 => 50,
        6 => 40,
        7 => 30,
        _ => 20,
    }
}

/// File name of an icon inside an icon set directory.
pub fn icon_file_name(icon_id: u32) -> String {
    format!("icon-{}.png", icon_id)
}

/// Drawing primitives the compositor needs.
pub trait ImageBackend {
    type Image;
    type Color: Copy;

    fn load(&self, path: &Path) -> Result<Self::Image>;

    /// Transparent canvas.
    fn blank(&self, width: u32, height: u32) -> Self::Image;

    fn dimensions(&self, image: &Self::Image) -> (u32, u32);

    fn flip_horizontal(&self, image: Self::Image) -> Self::Image;

    fn flip_vertical(&self, image: Self::Image) -> Self::Image;

    /// Rotate clockwise by a multiple of 90 degrees.
    fn rotate(&self, image: Self::Image, degrees: u32) -> Self::Image;

    fn resize(&self, image: Self::Image, width: u32, height: u32) -> Self::Image;

    fn color(&self, rgb: [u8; 3]) -> Self::Color;

    fn draw_line(&self, canvas: &mut Self::Image, from: (u32, u32), to: (u32, u32), color: Self::Color);

    /// Draw `image` onto `canvas` with its top-left corner at `(x, y)`.
    fn composite(&self, canvas: &mut Self::Image, image: &Self::Image, x: u32, y: u32);

    /// Encode to PNG bytes.
    fn encode(&self, image: &Self::Image) -> Result<Vec<u8>>;
}

/// Visual transforms applied per icon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositorSettings {
    pub rotate: bool,
    pub flip_horizontally: bool,
    pub flip_vertically: bool,
    pub border: bool,
}

impl Default for CompositorSettings {
    fn default() -> Self {
        Self {
            rotate: true,
            flip_horizontally: true,
            flip_vertically: true,
            border: true,
        }
    }
}

impl From<&ChallengeOptions> for CompositorSettings {
    fn from(options: &ChallengeOptions) -> Self {
        Self {
            rotate: options.rotate,
            flip_horizontally: options.flip.horizontally,
            flip_vertically: options.flip.vertically,
            border: options.border,
        }
    }
}

/// Where one slot's icon goes on the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPlacement {
    pub x: u32,
    pub y: u32,
}

/// Place an icon of `icon_width`x`icon_height` centered in slot `position`.
pub fn slot_placement(
    position: u32,
    icon_count: u32,
    canvas: (u32, u32),
    icon_width: u32,
    icon_height: u32,
) -> SlotPlacement {
    let slot_width = canvas.0 / icon_count.max(1);
    let x = slot_width * (position - 1) + slot_width.saturating_sub(icon_width) / 2;
    let y = canvas.1.saturating_sub(icon_height) / 2;
    SlotPlacement { x, y }
}

pub struct Compositor<B: ImageBackend> {
    backend: B,
    settings: CompositorSettings,
}

impl<B: ImageBackend> Compositor<B> {
    pub fn new(backend: B, settings: CompositorSettings) -> Self {
        Self { backend, settings }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Draw `icons` (position to icon id) from `icon_dir` onto the
    /// placeholder, or onto a blank reference-size canvas.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        icon_dir: &Path,
        placeholder: Option<&Path>,
        icons: &BTreeMap<u32, u32>,
        border_color: [u8; 3],
    ) -> Result<B::Image> {
        let mut canvas = match placeholder {
            Some(path) => self.backend.load(path)?,
            None => self.backend.blank(CANVAS_WIDTH, CANVAS_HEIGHT),
        };
        let canvas_size = self.backend.dimensions(&canvas);
        if canvas_size.0 == 0 || canvas_size.1 == 0 {
            return Err(CaptchaError::ImageProcessing(format!(
                "placeholder has no area ({}x{})",
                canvas_size.0, canvas_size.1
            )));
        }
        let icon_count = icons.len() as u32;
        let slot_width = canvas_size.0 / icon_count.max(1);
        // Icons never exceed the slot or the vertical margins.
        let max_edge = icon_size(icon_count)
            .min(slot_width)
            .min(canvas_size.1.saturating_sub(20).max(1));
        let color = self.backend.color(border_color);

        for (&position, &icon_id) in icons {
            let path: PathBuf = icon_dir.join(icon_file_name(icon_id));
            let mut icon = self.backend.load(&path)?;

            let (w, h) = self.backend.dimensions(&icon);
            if w > max_edge || h > max_edge {
                icon = self.backend.resize(icon, w.min(max_edge), h.min(max_edge));
            }

            icon = self.transform(rng, icon);

            let (w, h) = self.backend.dimensions(&icon);
            let placement = slot_placement(position, icon_count, canvas_size, w, h);
            self.backend
                .composite(&mut canvas, &icon, placement.x, placement.y);

            if self.settings.border && position < icon_count {
                let x = slot_width * position;
                let bottom = canvas_size.1.saturating_sub(1);
                self.backend.draw_line(&mut canvas, (x, 0), (x, bottom), color);
            }
        }

        Ok(canvas)
    }

    fn transform<R: Rng + ?Sized>(&self, rng: &mut R, mut icon: B::Image) -> B::Image {
        if self.settings.rotate {
            let degrees = rng.gen_range(1..=4u32) * 90;
            if degrees != 360 {
                icon = self.backend.rotate(icon, degrees);
            }
        }
        if self.settings.flip_horizontally && rng.gen_bool(0.5) {
            icon = self.backend.flip_horizontal(icon);
        }
        if self.settings.flip_vertically && rng.gen_bool(0.5) {
            icon = self.backend.flip_vertical(icon);
        }
        icon
    }

    /// Encode the canvas to PNG bytes.
    pub fn render(&self, image: &B::Image) -> Result<Vec<u8>> {
        self.backend.encode(image)
    }

    /// Encode the canvas as a base64 PNG.
    pub fn render_base64(&self, image: &B::Image) -> Result<String> {
        Ok(general_purpose::STANDARD.encode(self.render(image)?))
    }
}
