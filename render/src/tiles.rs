use std::time::Instant;

use structures::Dataset;
use tracing::{info, warn};

use crate::{errors::TileError, raster::Raster};

/// Canvas pixels per tile pixel at zoom 0 is `GLOBAL_SCALE`; every zoom
/// level halves it.
pub const GLOBAL_SCALE: u64 = 4;
pub const MAX_ZOOM: u32 = 16;
pub const MAX_TILE_SIZE: u32 = 1024;

/// Colors that do not move the whitening cutoff.
pub const NEUTRAL_COLORS: [[u8; 4]; 1] = [[0xFF, 0xFF, 0xFF, 0xFF]];

/// Shown for canvas pixels without any placement before the cutoff.
pub const BACKGROUND: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];
pub const TRANSPARENT: [u8; 4] = [0x00, 0x00, 0x00, 0x00];

/// The dataset palette with [`BACKGROUND`] appended when missing, and the
/// index of the background in it.
pub(crate) fn palette_with_background(palette: &[[u8; 4]]) -> (Vec<[u8; 4]>, u8) {
    let mut palette = palette.to_vec();
    let background = match palette.iter().position(|color| *color == BACKGROUND) {
        Some(index) => index as u8,
        None if palette.len() < 256 => {
            palette.push(BACKGROUND);
            (palette.len() - 1) as u8
        }
        None => {
            warn!("Palette is full, background uses the first color");
            0
        }
    };
    (palette, background)
}

/// The latest placement of a non-neutral color, or the end of the history
/// if every placement was neutral.
pub fn whitening_cutoff(dataset: &Dataset) -> i32 {
    let neutral: Vec<bool> = dataset
        .palette
        .iter()
        .map(|color| NEUTRAL_COLORS.contains(color))
        .collect();

    dataset
        .pixels()
        .filter_map(|(_, _, events)| {
            events
                .iter()
                .rev()
                .find(|event| !neutral[event.color_index as usize])
                .map(|event| event.delta_millis)
        })
        .max()
        .unwrap_or(dataset.end_millis)
}

/// Color index of every canvas pixel as of the whitening cutoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileSnapshot {
    pub width: u32,
    pub height: u32,
    /// Dataset palette, plus the background color if the dataset lacks it
    pub palette: Vec<[u8; 4]>,
    pub cutoff_millis: i32,
    pixels: Vec<u8>,
}

impl TileSnapshot {
    pub fn build(dataset: &Dataset) -> Self {
        let started = Instant::now();
        let cutoff_millis = whitening_cutoff(dataset);

        let (palette, background) = palette_with_background(&dataset.palette);
        let mut pixels = vec![background; dataset.width as usize * dataset.height as usize];
        for (x, y, events) in dataset.pixels() {
            let visible = events.partition_point(|event| event.delta_millis <= cutoff_millis);
            if visible > 0 {
                pixels[y as usize * dataset.width as usize + x as usize] =
                    events[visible - 1].color_index;
            }
        }

        info!(
            cutoff = %dataset.time_of(cutoff_millis),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Tile data ready"
        );

        Self {
            width: dataset.width,
            height: dataset.height,
            palette,
            cutoff_millis,
            pixels,
        }
    }

    pub fn color_index(&self, x: u32, y: u32) -> u8 {
        self.pixels[y as usize * self.width as usize + x as usize]
    }

    /// Color of an in-canvas pixel.
    pub fn color(&self, x: u32, y: u32) -> [u8; 4] {
        self.palette[self.color_index(x, y) as usize]
    }
}

/// The whole canvas at one canvas pixel per image pixel.
impl Raster for TileSnapshot {
    fn bounds(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn color_at(&self, x: u32, y: u32) -> [u8; 4] {
        self.color(x, y)
    }
}

/// Parsed from `/tiles/{x}_{y}_z{zoom}_{width}x{height}.png`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRequest {
    pub x: u32,
    pub y: u32,
    pub zoom: u32,
    pub width: u32,
    pub height: u32,
}

impl TileRequest {
    pub fn validate(&self) -> Result<(), TileError> {
        if self.zoom > MAX_ZOOM {
            return Err(TileError::Zoom {
                zoom: self.zoom,
                max: MAX_ZOOM,
            });
        }
        let valid = 1..=MAX_TILE_SIZE;
        if !valid.contains(&self.width) || !valid.contains(&self.height) {
            return Err(TileError::Size {
                width: self.width,
                height: self.height,
                max: MAX_TILE_SIZE,
            });
        }
        Ok(())
    }
}

pub struct TileWindow<'a> {
    snapshot: &'a TileSnapshot,
    request: TileRequest,
}

impl<'a> TileWindow<'a> {
    pub fn new(snapshot: &'a TileSnapshot, request: TileRequest) -> Self {
        Self { snapshot, request }
    }

    /// Canvas coordinate sampled by tile pixel `(x, y)`, if it is on the canvas.
    pub fn canvas_coordinate(&self, x: u32, y: u32) -> Option<(u32, u32)> {
        let request = &self.request;
        let abs_x = u64::from(request.x) * u64::from(request.width) + u64::from(x);
        let abs_y = u64::from(request.y) * u64::from(request.height) + u64::from(y);
        let canvas_x = (abs_x * GLOBAL_SCALE) >> request.zoom;
        let canvas_y = (abs_y * GLOBAL_SCALE) >> request.zoom;

        if canvas_x >= u64::from(self.snapshot.width) || canvas_y >= u64::from(self.snapshot.height)
        {
            return None;
        }
        Some((canvas_x as u32, canvas_y as u32))
    }
}

impl Raster for TileWindow<'_> {
    fn bounds(&self) -> (u32, u32) {
        (self.request.width, self.request.height)
    }

    fn color_at(&self, x: u32, y: u32) -> [u8; 4] {
        match self.canvas_coordinate(x, y) {
            Some((canvas_x, canvas_y)) => self.snapshot.color(canvas_x, canvas_y),
            None => TRANSPARENT,
        }
    }
}
