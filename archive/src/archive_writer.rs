use std::{
    io::Write,
    path::{Path, PathBuf},
    time::Instant,
};

use bincode::Encode;
use mla::{config::ArchiveWriterConfig, ArchiveWriter};
use structures::{Dataset, CHUNK_SIZE};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::{
    constants::{chunk_file_name, BINCODE_CONFIG, FILE_SUFFIX, META_FILE, USERS_FILE},
    errors::PlacedArchiveError,
    stored::{ChunkDescription, Meta, StoredCell},
};

pub struct PlacedArchiveWriter<'a, W: Write + Send> {
    mla: ArchiveWriter<'a, W>,
}

impl<'a, W: Write + Send + 'a> PlacedArchiveWriter<'a, W> {
    pub fn new(dest: W) -> Result<Self, PlacedArchiveError> {
        let mut config = ArchiveWriterConfig::new();
        // Compression stays on
        config.disable_layer(mla::Layers::ENCRYPT);
        let mla =
            ArchiveWriter::from_config(dest, config).map_err(PlacedArchiveError::MLAWriteError)?;

        Ok(PlacedArchiveWriter { mla })
    }

    /// Writes every chunk, the user list and finally the meta file.
    pub fn write_dataset(&mut self, dataset: &Dataset) -> Result<(), PlacedArchiveError> {
        let mut chunk_descs = Vec::with_capacity(dataset.chunks.len());

        for (i, chunk) in dataset.chunks.iter().enumerate() {
            let cells: Vec<StoredCell> = chunk
                .cells()
                .map(|(col, row, events)| StoredCell {
                    offset: (row * CHUNK_SIZE + col) as u16,
                    events: events.to_vec(),
                })
                .collect();
            let num_events: u32 = cells.iter().map(|cell| cell.events.len() as u32).sum();

            self.add_encoded(&chunk_file_name(i as u32), &cells)?;
            debug!(chunk = i, cells = cells.len(), num_events, "Wrote chunk");

            chunk_descs.push(ChunkDescription {
                id: i as u32,
                width: chunk.width,
                height: chunk.height,
                num_events,
            });
        }

        self.add_encoded(USERS_FILE, &dataset.user_ids)?;

        let meta = Meta {
            version: dataset.version.clone(),
            width: dataset.width,
            height: dataset.height,
            palette: dataset.palette.clone(),
            epoch_millis: dataset.epoch.and_utc().timestamp_millis(),
            start_millis: dataset.start_millis,
            end_millis: dataset.end_millis,
            chunk_stride: dataset.chunk_stride,
            num_users: dataset.user_ids.len() as u32,
            chunk_descs,
        };
        self.add_encoded(META_FILE, &meta)
    }

    pub fn finalize(mut self) -> Result<(), PlacedArchiveError> {
        self.mla
            .finalize()
            .map_err(PlacedArchiveError::MLAWriteError)
    }

    fn add_encoded<E: Encode>(&mut self, name: &str, value: E) -> Result<(), PlacedArchiveError> {
        let mut buf = Vec::new();
        bincode::encode_into_std_write(value, &mut buf, BINCODE_CONFIG).map_err(|source| {
            PlacedArchiveError::Encode {
                file: name.to_string(),
                source,
            }
        })?;

        self.mla
            .add_file(name, buf.len() as u64, buf.as_slice())
            .map_err(PlacedArchiveError::MLAWriteError)
    }
}

pub(crate) fn check_suffix(path: &Path) -> Result<(), PlacedArchiveError> {
    if path.to_string_lossy().ends_with(FILE_SUFFIX) {
        Ok(())
    } else {
        Err(PlacedArchiveError::WrongSuffix {
            path: PathBuf::from(path),
            suffix: FILE_SUFFIX,
        })
    }
}

/// Writes `dataset` to `path`.
///
/// The archive is assembled in a temporary file next to `path` and moved into
/// place once complete, so `path` never holds a partial archive.
pub fn save_to(path: &Path, dataset: &Dataset) -> Result<(), PlacedArchiveError> {
    check_suffix(path)?;
    let started = Instant::now();

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let temp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = PlacedArchiveWriter::new(temp.as_file())?;
        writer.write_dataset(dataset)?;
        writer.finalize()?;
    }
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| PlacedArchiveError::Io(err.error))?;

    info!(
        path = %path.display(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Wrote dataset to file"
    );
    Ok(())
}
