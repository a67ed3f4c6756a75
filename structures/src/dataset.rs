use bincode::{Decode, Encode};
use chrono::{Duration, NaiveDateTime};

/// Side length of a chunk, in pixels.
pub const CHUNK_SIZE: u32 = 256;
pub const CELLS_PER_CHUNK: usize = (CHUNK_SIZE * CHUNK_SIZE) as usize;

/// Color indices are stored in a single byte.
pub const MAX_PALETTE_SIZE: usize = 256;

pub const DATASET_VERSION: &str = "placed-index-v1";

/// One pixel placement as produced by a line parser, before indexing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub placed_at: NaiveDateTime,
    pub user: String,
    pub x: u32,
    pub y: u32,
    pub color: [u8; 4],
}

#[derive(Encode, Decode, Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelEvent {
    /// Milliseconds between the dataset epoch and this placement
    pub delta_millis: i32,
    pub user_index: u32,
    pub color_index: u8,
}

/// A 256x256 block of cells. Chunks on the right and bottom edge of the
/// canvas only use `width` x `height` of their cells.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub width: u32,
    pub height: u32,
    cells: Vec<Vec<PixelEvent>>,
}

fn cell_offset(col: u32, row: u32) -> usize {
    (row * CHUNK_SIZE + col) as usize
}

impl Chunk {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            cells: vec![Vec::new(); CELLS_PER_CHUNK],
        }
    }

    pub fn cell(&self, col: u32, row: u32) -> &[PixelEvent] {
        &self.cells[cell_offset(col, row)]
    }

    pub fn cell_mut(&mut self, col: u32, row: u32) -> &mut Vec<PixelEvent> {
        &mut self.cells[cell_offset(col, row)]
    }

    /// Non-empty cells as `(col, row, events)`.
    pub fn cells(&self) -> impl Iterator<Item = (u32, u32, &[PixelEvent])> + '_ {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, events)| !events.is_empty())
            .map(|(offset, events)| {
                let offset = offset as u32;
                (offset % CHUNK_SIZE, offset / CHUNK_SIZE, events.as_slice())
            })
    }

    pub(crate) fn cells_mut(&mut self) -> impl Iterator<Item = &mut Vec<PixelEvent>> + '_ {
        self.cells.iter_mut().filter(|events| !events.is_empty())
    }

    pub fn num_events(&self) -> usize {
        self.cells.iter().map(Vec::len).sum()
    }
}

/// Number of chunk columns and rows needed to cover a canvas.
pub fn chunk_grid(width: u32, height: u32) -> (u32, u32) {
    (width.div_ceil(CHUNK_SIZE), height.div_ceil(CHUNK_SIZE))
}

/// Allocates the row-major chunk grid for a canvas, trimming the effective
/// size of the edge chunks.
pub(crate) fn make_chunks(width: u32, height: u32) -> Vec<Chunk> {
    let (stride, rows) = chunk_grid(width, height);
    let mut chunks = Vec::with_capacity((stride * rows) as usize);
    for row in 0..rows {
        for col in 0..stride {
            let chunk_width = (width - col * CHUNK_SIZE).min(CHUNK_SIZE);
            let chunk_height = (height - row * CHUNK_SIZE).min(CHUNK_SIZE);
            chunks.push(Chunk::new(chunk_width, chunk_height));
        }
    }
    chunks
}

/// The finalized, immutable pixel history of a canvas.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dataset {
    /// Encoding version, should match DATASET_VERSION
    pub version: String,

    pub width: u32,
    pub height: u32,
    /// Colors by color index, in first-seen order
    pub palette: Vec<[u8; 4]>,

    /// Base time (t0) that event deltas are relative to
    pub epoch: NaiveDateTime,
    pub start_millis: i32,
    pub end_millis: i32,
    /// Chunks per row
    pub chunk_stride: u32,
    pub user_ids: Vec<String>,

    pub chunks: Vec<Chunk>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidDataset {
    #[error("version = {found:?}, want {expected:?}")]
    Version {
        found: String,
        expected: &'static str,
    },
    #[error("{found} chunks for a {width}x{height} canvas, want {expected}")]
    ChunkCount {
        found: usize,
        expected: usize,
        width: u32,
        height: u32,
    },
    #[error("palette of {0} colors exceeds one byte")]
    PaletteTooLarge(usize),
    #[error("pixel ({x}, {y}) uses color {index}, palette has {len}")]
    ColorIndex { x: u32, y: u32, index: u8, len: usize },
    #[error("pixel ({x}, {y}) uses user {index}, {len} users recorded")]
    UserIndex { x: u32, y: u32, index: u32, len: usize },
    #[error("pixel ({x}, {y}) events are not sorted by time")]
    Unsorted { x: u32, y: u32 },
}

impl Dataset {
    pub fn chunk_at(&self, chunk_x: u32, chunk_y: u32) -> &Chunk {
        &self.chunks[(chunk_y * self.chunk_stride + chunk_x) as usize]
    }

    /// Sorted event history of one pixel, or None outside the canvas.
    pub fn events_at(&self, x: u32, y: u32) -> Option<&[PixelEvent]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let chunk = self.chunk_at(x / CHUNK_SIZE, y / CHUNK_SIZE);
        Some(chunk.cell(x % CHUNK_SIZE, y % CHUNK_SIZE))
    }

    /// All non-empty pixels as `(x, y, events)` in absolute canvas coordinates.
    pub fn pixels(&self) -> impl Iterator<Item = (u32, u32, &[PixelEvent])> + '_ {
        self.chunks.iter().enumerate().flat_map(move |(i, chunk)| {
            let base_x = (i as u32 % self.chunk_stride) * CHUNK_SIZE;
            let base_y = (i as u32 / self.chunk_stride) * CHUNK_SIZE;
            chunk
                .cells()
                .map(move |(col, row, events)| (base_x + col, base_y + row, events))
        })
    }

    pub fn color(&self, color_index: u8) -> Option<[u8; 4]> {
        self.palette.get(color_index as usize).copied()
    }

    pub fn time_of(&self, delta_millis: i32) -> NaiveDateTime {
        self.epoch + Duration::milliseconds(delta_millis.into())
    }

    /// Timestamp of the first placement.
    pub fn start(&self) -> NaiveDateTime {
        self.time_of(self.start_millis)
    }

    /// Timestamp of the final placement.
    pub fn end(&self) -> NaiveDateTime {
        self.time_of(self.end_millis)
    }

    pub fn num_events(&self) -> usize {
        self.chunks.iter().map(Chunk::num_events).sum()
    }

    /// Checks the structural invariants of a dataset that did not come out of
    /// a `DatasetBuilder`, e.g. one decoded from disk.
    pub fn validate(&self) -> Result<(), InvalidDataset> {
        if self.version != DATASET_VERSION {
            return Err(InvalidDataset::Version {
                found: self.version.clone(),
                expected: DATASET_VERSION,
            });
        }

        let (stride, rows) = chunk_grid(self.width, self.height);
        let expected = (stride * rows) as usize;
        if self.chunk_stride != stride || self.chunks.len() != expected {
            return Err(InvalidDataset::ChunkCount {
                found: self.chunks.len(),
                expected,
                width: self.width,
                height: self.height,
            });
        }

        if self.palette.len() > MAX_PALETTE_SIZE {
            return Err(InvalidDataset::PaletteTooLarge(self.palette.len()));
        }

        for (x, y, events) in self.pixels() {
            for event in events {
                if event.color_index as usize >= self.palette.len() {
                    return Err(InvalidDataset::ColorIndex {
                        x,
                        y,
                        index: event.color_index,
                        len: self.palette.len(),
                    });
                }
                if event.user_index as usize >= self.user_ids.len() {
                    return Err(InvalidDataset::UserIndex {
                        x,
                        y,
                        index: event.user_index,
                        len: self.user_ids.len(),
                    });
                }
            }
            if events
                .windows(2)
                .any(|pair| pair[0].delta_millis > pair[1].delta_millis)
            {
                return Err(InvalidDataset::Unsorted { x, y });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_grid_rounds_up() {
        assert_eq!(chunk_grid(2000, 2000), (8, 8));
        assert_eq!(chunk_grid(1001, 1001), (4, 4));
        assert_eq!(chunk_grid(256, 512), (1, 2));
        assert_eq!(chunk_grid(257, 1), (2, 1));
    }

    #[test]
    fn edge_chunks_have_effective_size() {
        let chunks = make_chunks(2000, 1001);
        assert_eq!(chunks.len(), 8 * 4);

        assert_eq!((chunks[0].width, chunks[0].height), (256, 256));
        // last column
        assert_eq!((chunks[7].width, chunks[7].height), (208, 256));
        // last row, first column
        assert_eq!((chunks[24].width, chunks[24].height), (256, 233));
        // bottom right corner
        assert_eq!((chunks[31].width, chunks[31].height), (208, 233));
    }

    #[test]
    fn chunk_cells_report_coordinates() {
        let mut chunk = Chunk::new(256, 256);
        let event = PixelEvent {
            delta_millis: 5,
            user_index: 0,
            color_index: 0,
        };
        chunk.cell_mut(3, 200).push(event);

        let cells: Vec<_> = chunk.cells().collect();
        assert_eq!(cells, vec![(3, 200, &[event][..])]);
        assert_eq!(chunk.num_events(), 1);
    }
}
