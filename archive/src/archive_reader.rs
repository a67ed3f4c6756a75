use std::{
    fs::File,
    io::{BufReader, Read, Seek},
    path::Path,
    time::Instant,
};

use bincode::Decode;
use chrono::DateTime;
use mla::{config::ArchiveReaderConfig, ArchiveReader};
use structures::{Chunk, Dataset, CHUNK_SIZE, DATASET_VERSION};
use tracing::info;

use crate::{
    archive_writer::check_suffix,
    constants::{chunk_file_name, BINCODE_CONFIG, META_FILE, USERS_FILE},
    errors::PlacedArchiveError,
    stored::{Meta, StoredCell},
};

pub struct PlacedArchiveReader<'a, R: Read + Seek + Send> {
    mla: ArchiveReader<'a, R>,
    pub meta: Meta,
}

impl<'a, R: Read + Seek + Send + 'a> PlacedArchiveReader<'a, R> {
    /// Opens the archive and reads its meta file. Archives written with a
    /// different encoding version are rejected here.
    pub fn new(reader: R) -> Result<Self, PlacedArchiveError> {
        let mut mla = ArchiveReader::from_config(reader, ArchiveReaderConfig::new())
            .map_err(PlacedArchiveError::MLAReadError)?;

        let meta: Meta = read_entry(&mut mla, META_FILE)?;
        if meta.version != DATASET_VERSION {
            return Err(PlacedArchiveError::VersionMismatch {
                found: meta.version,
                expected: DATASET_VERSION,
            });
        }

        Ok(Self { mla, meta })
    }

    pub fn read_users(&mut self) -> Result<Vec<String>, PlacedArchiveError> {
        read_entry(&mut self.mla, USERS_FILE)
    }

    pub fn read_chunk(&mut self, id: u32) -> Result<Chunk, PlacedArchiveError> {
        let desc = self
            .meta
            .chunk_descs
            .get(id as usize)
            .cloned()
            .ok_or_else(|| PlacedArchiveError::MissingFile(chunk_file_name(id)))?;

        let cells: Vec<StoredCell> = read_entry(&mut self.mla, &chunk_file_name(id))?;

        let mut chunk = Chunk::new(desc.width, desc.height);
        for cell in cells {
            let offset = u32::from(cell.offset);
            *chunk.cell_mut(offset % CHUNK_SIZE, offset / CHUNK_SIZE) = cell.events;
        }
        Ok(chunk)
    }

    /// Reads every chunk and assembles the full dataset.
    pub fn into_dataset(mut self) -> Result<Dataset, PlacedArchiveError> {
        let user_ids = self.read_users()?;
        let chunks = (0..self.meta.chunk_descs.len() as u32)
            .map(|id| self.read_chunk(id))
            .collect::<Result<Vec<_>, _>>()?;

        let meta = self.meta;
        let epoch = DateTime::from_timestamp_millis(meta.epoch_millis)
            .ok_or(PlacedArchiveError::InvalidEpoch(meta.epoch_millis))?
            .naive_utc();

        let dataset = Dataset {
            version: meta.version,
            width: meta.width,
            height: meta.height,
            palette: meta.palette,
            epoch,
            start_millis: meta.start_millis,
            end_millis: meta.end_millis,
            chunk_stride: meta.chunk_stride,
            user_ids,
            chunks,
        };
        dataset.validate()?;

        Ok(dataset)
    }
}

fn read_entry<'a, R, D>(
    mla: &mut ArchiveReader<'a, R>,
    name: &str,
) -> Result<D, PlacedArchiveError>
where
    R: Read + Seek + Send + 'a,
    D: Decode<()>,
{
    let mut file = match mla.get_file(name.to_string()) {
        Ok(Some(file)) => file,
        Ok(None) => return Err(PlacedArchiveError::MissingFile(name.to_string())),
        Err(err) => return Err(PlacedArchiveError::MLAReadError(err)),
    };

    bincode::decode_from_std_read(&mut file.data, BINCODE_CONFIG).map_err(|source| {
        PlacedArchiveError::Decode {
            file: name.to_string(),
            source,
        }
    })
}

/// Reads a dataset previously written with [`crate::save_to`].
pub fn load(path: &Path) -> Result<Dataset, PlacedArchiveError> {
    check_suffix(path)?;
    let started = Instant::now();

    let file = File::open(path)?;
    let reader = PlacedArchiveReader::new(BufReader::new(file))?;
    let dataset = reader.into_dataset()?;

    info!(
        path = %path.display(),
        events = dataset.num_events(),
        users = dataset.user_ids.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Loaded dataset"
    );
    Ok(dataset)
}
