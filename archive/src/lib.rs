mod archive_reader;
mod archive_writer;
mod constants;
mod errors;
pub mod stored;

pub use crate::archive_reader::{load, PlacedArchiveReader};
pub use crate::archive_writer::{save_to, PlacedArchiveWriter};
pub use crate::constants::FILE_SUFFIX;
pub use crate::errors::PlacedArchiveError;
