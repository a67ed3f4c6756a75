use std::io::Cursor;

use image::{ImageBuffer, ImageOutputFormat, Rgba, RgbaImage};

use crate::errors::EncodeError;

/// Anything that can be sampled pixel by pixel into RGBA.
pub trait Raster {
    /// Width and height in pixels.
    fn bounds(&self) -> (u32, u32);

    /// Color of a pixel, for `x < width` and `y < height`.
    fn color_at(&self, x: u32, y: u32) -> [u8; 4];

    fn to_rgba(&self) -> RgbaImage {
        let (width, height) = self.bounds();
        ImageBuffer::from_fn(width, height, |x, y| Rgba(self.color_at(x, y)))
    }
}

pub fn encode_png(raster: &impl Raster) -> Result<Vec<u8>, EncodeError> {
    let mut buf = Cursor::new(Vec::new());
    raster.to_rgba().write_to(&mut buf, ImageOutputFormat::Png)?;
    Ok(buf.into_inner())
}
