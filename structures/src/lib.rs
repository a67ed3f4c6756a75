mod builder;
mod dataset;

pub use crate::builder::{BuildError, DatasetBuilder};
pub use crate::dataset::{
    chunk_grid, Chunk, Dataset, InvalidDataset, PixelEvent, RawEvent, CELLS_PER_CHUNK, CHUNK_SIZE,
    DATASET_VERSION, MAX_PALETTE_SIZE,
};
