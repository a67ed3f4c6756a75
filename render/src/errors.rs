#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("PNG encoding failed: {0}")]
    Png(#[from] png::EncodingError),
    #[error("image encoding failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("GIF encoding failed: {0}")]
    Gif(#[from] gif::EncodingError),
    #[error("{width}x{height} is too large for a GIF")]
    TooLarge { width: u32, height: u32 },
    #[error("timelapse has no frames")]
    NoFrames,
}

/// A tile request outside the supported range.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TileError {
    #[error("zoom {zoom} is deeper than {max}")]
    Zoom { zoom: u32, max: u32 },
    #[error("tile size {width}x{height} must be within 1..={max}")]
    Size { width: u32, height: u32, max: u32 },
}
