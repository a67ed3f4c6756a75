use std::{
    fmt,
    io::{self, Cursor},
    path::PathBuf,
};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use futures::TryStreamExt;
use tokio::io::{AsyncRead, BufReader};
use tokio_util::io::StreamReader;

use crate::{
    errors::ShardError,
    parse::{parse_line_2017, parse_line_2022, LineParser, HEADER_2017, HEADER_2022},
};

pub type ShardReader = Box<dyn AsyncRead + Send + Unpin>;

/// An open shard stream and its size in bytes, when known up front.
pub struct OpenedShard {
    pub reader: ShardReader,
    pub len: Option<u64>,
}

/// Format of one dataset vintage. Every shard of a dataset shares it.
#[derive(Clone, Copy)]
pub struct Source {
    pub year: i32,
    /// Canvases so far have been square
    pub canvas_size: u32,
    /// If set, shards are decompressed before being read as CSV
    pub gzipped: bool,
    /// Expected first line of every shard
    pub header: &'static str,
    pub parse_line: LineParser,
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("year", &self.year)
            .field("canvas_size", &self.canvas_size)
            .field("gzipped", &self.gzipped)
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

impl Source {
    pub fn year_2017() -> Self {
        Self {
            year: 2017,
            canvas_size: 1001,
            gzipped: false,
            header: HEADER_2017,
            parse_line: parse_line_2017,
        }
    }

    pub fn year_2022() -> Self {
        Self {
            year: 2022,
            canvas_size: 2000,
            gzipped: true,
            header: HEADER_2022,
            parse_line: parse_line_2022,
        }
    }

    pub fn for_year(year: i32) -> Option<Self> {
        match year {
            2017 => Some(Self::year_2017()),
            2022 => Some(Self::year_2022()),
            _ => None,
        }
    }

    /// Events are stored relative to midnight UTC on April 1st.
    pub fn epoch(&self) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(self.year, 4, 1)
            .unwrap_or(NaiveDate::MIN)
            .and_time(NaiveTime::MIN)
    }

    /// The published download locations for this vintage.
    pub fn default_shards(&self) -> Vec<Box<dyn ShardSource>> {
        let urls = match self.year {
            2017 => shards_2017(),
            2022 => shards_2022(),
            _ => Vec::new(),
        };
        let client = reqwest::Client::new();
        urls.into_iter()
            .map(|url| Box::new(HttpShard::new(client.clone(), url)) as Box<dyn ShardSource>)
            .collect()
    }
}

pub fn shards_2017() -> Vec<String> {
    vec!["https://storage.googleapis.com/justin_bassett/place_tiles".to_string()]
}

pub fn shards_2022() -> Vec<String> {
    (0..78)
        .map(|i| {
            format!(
                "https://placedata.reddit.com/data/canvas-history/2022_place_canvas_history-{:012}.csv.gzip",
                i
            )
        })
        .collect()
}

/// One independently readable piece of a dataset.
#[async_trait]
pub trait ShardSource: Send + Sync {
    /// Location of the shard, for logs.
    fn describe(&self) -> String;

    async fn open(&self) -> Result<OpenedShard, ShardError>;
}

pub struct HttpShard {
    client: reqwest::Client,
    url: String,
}

impl HttpShard {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl ShardSource for HttpShard {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn open(&self) -> Result<OpenedShard, ShardError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|source| ShardError::Request {
                url: self.url.clone(),
                source,
            })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(ShardError::Status {
                url: self.url.clone(),
                status,
            });
        }

        let len = response.content_length();
        let body = Box::pin(response.bytes_stream().map_err(io::Error::other));
        Ok(OpenedShard {
            reader: Box::new(StreamReader::new(body)),
            len,
        })
    }
}

pub struct FileShard {
    path: PathBuf,
}

impl FileShard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ShardSource for FileShard {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn open(&self) -> Result<OpenedShard, ShardError> {
        let open_error = |source| ShardError::Open {
            path: self.path.clone(),
            source,
        };
        let file = tokio::fs::File::open(&self.path).await.map_err(open_error)?;
        let len = file.metadata().await.map_err(open_error)?.len();
        Ok(OpenedShard {
            reader: Box::new(BufReader::new(file)),
            len: Some(len),
        })
    }
}

pub struct InMemoryShard {
    name: String,
    data: Bytes,
}

impl InMemoryShard {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

#[async_trait]
impl ShardSource for InMemoryShard {
    fn describe(&self) -> String {
        self.name.clone()
    }

    async fn open(&self) -> Result<OpenedShard, ShardError> {
        Ok(OpenedShard {
            reader: Box::new(Cursor::new(self.data.clone())),
            len: Some(self.data.len() as u64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_years() {
        let source = Source::for_year(2022).unwrap();
        assert_eq!(source.canvas_size, 2000);
        assert!(source.gzipped);
        assert_eq!(source.epoch().to_string(), "2022-04-01 00:00:00");

        assert_eq!(Source::for_year(2017).unwrap().canvas_size, 1001);
        assert!(Source::for_year(2019).is_none());
    }

    #[tokio::test]
    async fn local_shards_know_their_size() {
        let shard = InMemoryShard::new("mem", &b"abcdef"[..]);
        assert_eq!(shard.open().await.unwrap().len, Some(6));

        let dir = std::env::temp_dir().join(format!("placed-shard-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("shard.csv");
        std::fs::write(&path, "0123456789").unwrap();
        assert_eq!(FileShard::new(&path).open().await.unwrap().len, Some(10));
        std::fs::remove_dir_all(&dir).unwrap();

        let err = FileShard::new(dir.join("missing.csv")).open().await.err().unwrap();
        assert!(matches!(err, ShardError::Open { .. }));
    }

    #[test]
    fn shard_lists() {
        assert_eq!(shards_2017().len(), 1);

        let shards = shards_2022();
        assert_eq!(shards.len(), 78);
        assert!(shards[77].ends_with("2022_place_canvas_history-000000000077.csv.gzip"));
    }
}
