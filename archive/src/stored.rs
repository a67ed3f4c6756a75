use bincode::{Decode, Encode};
use structures::PixelEvent;

#[derive(Encode, Decode, PartialEq, Eq, Debug, Clone)]
pub struct ChunkDescription {
    pub id: u32,
    pub width: u32,
    pub height: u32,
    pub num_events: u32,
}

/// A non-empty cell. `offset` is `row * 256 + col` within the chunk.
#[derive(Encode, Decode, PartialEq, Eq, Debug, Clone)]
pub struct StoredCell {
    pub offset: u16,
    pub events: Vec<PixelEvent>,
}

#[derive(Encode, Decode, PartialEq, Eq, Debug, Clone)]
pub struct Meta {
    pub version: String,
    pub width: u32,
    pub height: u32,
    pub palette: Vec<[u8; 4]>,
    pub epoch_millis: i64,
    pub start_millis: i32,
    pub end_millis: i32,
    pub chunk_stride: u32,
    pub num_users: u32,
    pub chunk_descs: Vec<ChunkDescription>,
}

impl Meta {
    pub fn num_events(&self) -> u64 {
        self.chunk_descs
            .iter()
            .map(|desc| u64::from(desc.num_events))
            .sum()
    }
}
