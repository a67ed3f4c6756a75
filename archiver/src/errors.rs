use std::path::PathBuf;

use structures::BuildError;

/// A source line that could not be turned into raw events.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("columns = {found}, want {expected}")]
    Columns { found: usize, expected: usize },
    #[error("timestamp {value:?} invalid: {reason}")]
    Timestamp { value: String, reason: String },
    #[error("{axis} coordinate {value:?} invalid")]
    Coordinate { axis: &'static str, value: String },
    #[error("coordinate {0:?} is neither \"x,y\" nor \"x1,y1,x2,y2\"")]
    CoordinateShape(String),
    #[error("color {0:?} invalid")]
    Color(String),
}

/// Failure to fetch or decode a shard's byte stream.
#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    #[error("GET {url:?} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("GET {url:?} returned {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("could not open {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("reading shard: {0}")]
    Read(#[from] csv::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum LineError {
    #[error("header = {found:?}, want {expected:?}")]
    HeaderMismatch {
        found: String,
        expected: &'static str,
    },
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Build(#[from] BuildError),
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("download[{shard}]: {source}")]
    Shard {
        shard: usize,
        #[source]
        source: ShardError,
    },
    #[error("download[{shard}]: line {line} ({text:?}): {source}")]
    Line {
        shard: usize,
        line: u64,
        text: String,
        #[source]
        source: LineError,
    },
    #[error("ingestion cancelled")]
    Cancelled,
    #[error("shard task did not finish: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Build(#[from] BuildError),
}
