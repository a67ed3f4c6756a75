use std::path::PathBuf;

use structures::InvalidDataset;

#[derive(Debug, thiserror::Error)]
pub enum PlacedArchiveError {
    #[error("{path:?} does not have required suffix {suffix:?}")]
    WrongSuffix { path: PathBuf, suffix: &'static str },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("could not read archive: {0:?}")]
    MLAReadError(mla::errors::Error),
    #[error("could not write archive: {0:?}")]
    MLAWriteError(mla::errors::Error),
    #[error("archive has no {0:?} file")]
    MissingFile(String),
    #[error("could not decode {file:?}: {source}")]
    Decode {
        file: String,
        #[source]
        source: bincode::error::DecodeError,
    },
    #[error("could not encode {file:?}: {source}")]
    Encode {
        file: String,
        #[source]
        source: bincode::error::EncodeError,
    },
    #[error("version = {found:?}, want {expected:?}")]
    VersionMismatch {
        found: String,
        expected: &'static str,
    },
    #[error("epoch {0}ms is not a valid timestamp")]
    InvalidEpoch(i64),
    #[error("archive does not hold a valid dataset: {0}")]
    InvalidDataset(#[from] InvalidDataset),
}
