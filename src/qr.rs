use crate::error::Result;
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use qrcode::{Color, EcLevel, QrCode, Version};
use std::io::Cursor;

#[derive(Debug, Clone, Copy)]
pub struct QrOptions {
    pub ec_level: EcLevel,
    /// Side length of one module in pixels.
    pub module_size: u32,
    /// Quiet zone width in modules.
    pub border: u32,
    /// Fixed symbol version. `None` picks the smallest version that fits.
    pub version: Option<Version>,
}

impl Default for QrOptions {
    fn default() -> Self {
        QrOptions {
            ec_level: EcLevel::L,
            module_size: 5,
            border: 2,
            version: None,
        }
    }
}

pub fn encode(content: &str, options: &QrOptions) -> Result<Vec<u8>> {
    let code = match options.version {
        Some(version) => QrCode::with_version(content, version, options.ec_level)?,
        None => QrCode::with_error_correction_level(content, options.ec_level)?,
    };
    let mut png = Vec::new();
    DynamicImage::ImageLuma8(render(&code, options))
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
    Ok(png)
}

fn render(code: &QrCode, options: &QrOptions) -> GrayImage {
    let width = code.width() as u32;
    let colors = code.to_colors();
    let scale = options.module_size.max(1);
    let side = (width + 2 * options.border) * scale;
    GrayImage::from_fn(side, side, |x, y| {
        let (mx, my) = (x / scale, y / scale);
        let inside = (options.border..options.border + width).contains(&mx)
            && (options.border..options.border + width).contains(&my);
        let dark = inside && {
            let idx = (my - options.border) * width + (mx - options.border);
            colors[idx as usize] == Color::Dark
        };
        if dark {
            Luma([0])
        } else {
            Luma([255])
        }
    })
}
