//! Ingestion of raw r/place placement logs into a [`structures::Dataset`].

mod errors;
mod ingest;
pub mod parse;
mod source;

pub use crate::errors::{IngestError, LineError, ParseError, ShardError};
pub use crate::ingest::ingest;
pub use crate::source::{
    shards_2017, shards_2022, FileShard, HttpShard, InMemoryShard, OpenedShard, ShardReader,
    ShardSource,
    Source,
};
