use std::{
    io::{self, BufReader, Read},
    mem,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use csv::StringRecord;
use flate2::read::MultiGzDecoder;
use structures::{BuildError, Dataset, DatasetBuilder};
use tokio::{
    sync::mpsc,
    task::JoinSet,
    time::{interval_at, MissedTickBehavior},
};
use tokio_util::{io::SyncIoBridge, sync::CancellationToken};
use tracing::{debug, info};

use crate::{
    errors::{IngestError, LineError, ShardError},
    parse::{line_text, Placement},
    source::{ShardSource, Source},
};

/// Lines handed to the builder per channel message.
const BATCH_LINES: usize = 1000;
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);
const READ_BUFFER_SIZE: usize = 64 * 1024;

struct ParsedLine {
    number: u64,
    record: StringRecord,
    placement: Option<Placement>,
}

struct LineBatch {
    shard: usize,
    lines: Vec<ParsedLine>,
}

/// Raw bytes pulled from every shard, against the sizes the shards announced.
#[derive(Default)]
struct ByteProgress {
    read: AtomicU64,
    expected: AtomicU64,
    unsized_shards: AtomicUsize,
}

impl ByteProgress {
    fn announce(&self, len: Option<u64>) {
        if let Some(len) = len {
            self.expected.fetch_add(len, Ordering::Relaxed);
        } else {
            self.unsized_shards.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    fn expected(&self) -> u64 {
        self.expected.load(Ordering::Relaxed)
    }
}

/// Counts the compressed bytes of a shard as they are read.
struct CountingReader<R> {
    inner: R,
    progress: Arc<ByteProgress>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.progress.read.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}

fn line_error(shard: usize, line: u64, record: &StringRecord, source: LineError) -> IngestError {
    IngestError::Line {
        shard,
        line,
        text: line_text(record),
        source,
    }
}

/// Downloads every shard concurrently and indexes their events.
///
/// Shards are read and parsed in parallel, but events are added to the
/// builder by this task alone. The first failure of any shard cancels the
/// others and is returned; no partial dataset escapes.
pub async fn ingest(
    source: &Source,
    shards: Vec<Box<dyn ShardSource>>,
    cancel: &CancellationToken,
) -> Result<Dataset, IngestError> {
    let started = Instant::now();
    let num_shards = shards.len();

    // Dropped on every return path, stopping whatever shards are still running
    let shard_cancel = cancel.child_token();
    let _stop_shards = shard_cancel.clone().drop_guard();

    let bytes = Arc::new(ByteProgress::default());
    let (tx, mut rx) = mpsc::channel::<LineBatch>(2 * num_shards.max(1));
    let mut tasks = JoinSet::new();
    for (index, shard) in shards.into_iter().enumerate() {
        debug!(shard = index, location = %shard.describe(), "Starting shard");
        tasks.spawn(read_shard(
            index,
            *source,
            shard,
            tx.clone(),
            bytes.clone(),
            shard_cancel.clone(),
        ));
    }
    drop(tx);

    let mut builder = DatasetBuilder::new(source.canvas_size, source.canvas_size, source.epoch());
    let mut progress = interval_at(
        tokio::time::Instant::now() + PROGRESS_INTERVAL,
        PROGRESS_INTERVAL,
    );
    progress.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut lines_processed: u64 = 0;
    let mut shards_done: usize = 0;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => return Err(IngestError::Cancelled),

            Some(joined) = tasks.join_next() => {
                let lines = joined??;
                shards_done += 1;
                debug!(shards_done, num_shards, lines, "Shard complete");
            }

            batch = rx.recv() => match batch {
                Some(batch) => {
                    for line in batch.lines {
                        if let Some(placement) = &line.placement {
                            add_placement(&mut builder, placement).map_err(|err| {
                                line_error(batch.shard, line.number, &line.record, err.into())
                            })?;
                        }
                        lines_processed += 1;
                    }
                }
                None => break,
            },

            _ = progress.tick() => {
                info!(
                    lines = lines_processed,
                    events = builder.num_events(),
                    bytes_read = bytes.read(),
                    bytes_expected = bytes.expected(),
                    unsized_shards = bytes.unsized_shards.load(Ordering::Relaxed),
                    shards_done,
                    num_shards,
                    elapsed_secs = started.elapsed().as_secs(),
                    "Ingestion progress"
                );
            }
        }
    }

    // Every sender is gone, but results of the last shards may still be queued
    while let Some(joined) = tasks.join_next().await {
        joined??;
        shards_done += 1;
    }

    let dataset = builder.finalize()?;
    info!(
        lines = lines_processed,
        events = dataset.num_events(),
        bytes_read = bytes.read(),
        shards = shards_done,
        elapsed_secs = started.elapsed().as_secs(),
        "Ingestion complete"
    );
    Ok(dataset)
}

/// Rectangles are checked against the canvas as a whole before a single
/// event is expanded from them.
fn add_placement(builder: &mut DatasetBuilder, placement: &Placement) -> Result<(), BuildError> {
    let area = placement.area;
    builder.check_bounds(area.max_x, area.max_y)?;
    placement.events().try_for_each(|event| builder.add(event))
}

async fn read_shard(
    index: usize,
    source: Source,
    shard: Box<dyn ShardSource>,
    tx: mpsc::Sender<LineBatch>,
    bytes: Arc<ByteProgress>,
    cancel: CancellationToken,
) -> Result<u64, IngestError> {
    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(IngestError::Cancelled),
        reader = shard.open() => reader.map_err(|source| IngestError::Shard { shard: index, source })?,
    };

    // The bridge must be created on the runtime, then moved to a blocking thread
    bytes.announce(opened.len);
    let reader = CountingReader {
        inner: SyncIoBridge::new(opened.reader),
        progress: bytes,
    };
    tokio::task::spawn_blocking(move || read_lines(index, &source, reader, &tx, &cancel)).await?
}

fn read_lines(
    index: usize,
    source: &Source,
    reader: impl Read,
    tx: &mpsc::Sender<LineBatch>,
    cancel: &CancellationToken,
) -> Result<u64, IngestError> {
    let reader = BufReader::with_capacity(READ_BUFFER_SIZE, reader);
    let reader: Box<dyn Read> = if source.gzipped {
        Box::new(MultiGzDecoder::new(reader))
    } else {
        Box::new(reader)
    };

    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);

    let send = |lines: Vec<ParsedLine>| -> Result<(), IngestError> {
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        // A closed channel means the coordinator already gave up
        tx.blocking_send(LineBatch {
            shard: index,
            lines,
        })
        .map_err(|_| IngestError::Cancelled)
    };

    let mut lines_read: u64 = 0;
    let mut pending = Vec::with_capacity(BATCH_LINES);
    for result in csv_reader.records() {
        let record = result.map_err(|err| IngestError::Shard {
            shard: index,
            source: ShardError::from(err),
        })?;
        lines_read += 1;
        let number = record
            .position()
            .map_or(lines_read, |position| position.line());

        if lines_read == 1 {
            let found = line_text(&record);
            if found != source.header {
                return Err(line_error(
                    index,
                    number,
                    &record,
                    LineError::HeaderMismatch {
                        found,
                        expected: source.header,
                    },
                ));
            }
            continue;
        }

        let placement = (source.parse_line)(&record)
            .map_err(|err| line_error(index, number, &record, err.into()))?;
        pending.push(ParsedLine {
            number,
            record,
            placement,
        });

        if pending.len() >= BATCH_LINES {
            send(mem::replace(&mut pending, Vec::with_capacity(BATCH_LINES)))?;
        }
    }
    if !pending.is_empty() {
        send(pending)?;
    }

    debug!(shard = index, lines = lines_read, "Shard read");
    Ok(lines_read)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::{write::GzEncoder, Compression};

    use crate::{
        errors::ParseError,
        parse::{HEADER_2017, HEADER_2022},
        source::InMemoryShard,
    };

    use super::*;

    fn shard_2022(name: &str, body: &str) -> Box<dyn ShardSource> {
        Box::new(InMemoryShard::new(
            name,
            format!("{HEADER_2022}\n{body}").into_bytes(),
        ))
    }

    fn plain_2022() -> Source {
        Source {
            gzipped: false,
            ..Source::year_2022()
        }
    }

    fn pixel_lines(count: usize, minute: usize) -> String {
        (0..count)
            .map(|i| {
                format!(
                    "2022-04-01 12:{minute:02}:{:02}.{:03} UTC,user{},#FF4500,\"{},{}\"\n",
                    i % 60,
                    i % 1000,
                    i % 7,
                    i % 2000,
                    i / 2000
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn every_line_becomes_an_event() {
        let shards = vec![
            shard_2022("a", &pixel_lines(2500, 0)),
            shard_2022("b", &pixel_lines(10, 1)),
            shard_2022("empty", ""),
        ];

        let dataset = ingest(&plain_2022(), shards, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(dataset.num_events(), 2510);
        assert_eq!(dataset.palette, vec![[0xFF, 0x45, 0x00, 0xFF]]);
        assert_eq!(dataset.user_ids.len(), 7);
        assert_eq!(dataset.validate(), Ok(()));
    }

    #[tokio::test]
    async fn rectangle_line_becomes_many_events() {
        let shards = vec![shard_2022(
            "admin",
            "2022-04-04 01:00:00 UTC,admin,#000000,\"0,0,9,4\"\n",
        )];

        let dataset = ingest(&plain_2022(), shards, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(dataset.num_events(), 50);
        assert_eq!(dataset.events_at(9, 4).unwrap().len(), 1);
        assert!(dataset.events_at(10, 4).unwrap().is_empty());
    }

    #[tokio::test]
    async fn gzipped_shards_are_decompressed() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        write!(encoder, "{HEADER_2022}\n{}", pixel_lines(100, 3)).unwrap();
        let shards: Vec<Box<dyn ShardSource>> =
            vec![Box::new(InMemoryShard::new("gz", encoder.finish().unwrap()))];

        let dataset = ingest(&Source::year_2022(), shards, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(dataset.num_events(), 100);
    }

    #[tokio::test]
    async fn bad_header_aborts_everything() {
        let shards = vec![
            shard_2022("good", &pixel_lines(3000, 0)),
            Box::new(InMemoryShard::new(
                "bad",
                format!("{HEADER_2017}\n{}", pixel_lines(10, 1)).into_bytes(),
            )) as Box<dyn ShardSource>,
            shard_2022("also good", &pixel_lines(3000, 2)),
        ];

        let err = ingest(&plain_2022(), shards, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            IngestError::Line {
                shard,
                line,
                source: LineError::HeaderMismatch { found, .. },
                ..
            } => {
                assert_eq!(shard, 1);
                assert_eq!(line, 1);
                assert_eq!(found, HEADER_2017);
            }
            err => panic!("unexpected error: {err}"),
        }
    }

    #[tokio::test]
    async fn malformed_line_names_shard_and_line() {
        let body = "2022-04-01 12:00:00 UTC,u,#FFFFFF,\"1,1\"\n\
                    2022-04-01 12:00:01 UTC,u,#FFFFFF,\"1,x\"\n";
        let shards = vec![shard_2022("a", &pixel_lines(5, 0)), shard_2022("b", body)];

        let err = ingest(&plain_2022(), shards, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "download[1]: line 3 (\"2022-04-01 12:00:01 UTC,u,#FFFFFF,\\\"1,x\\\"\"): \
             y coordinate \"x\" invalid"
        );
        assert!(matches!(
            err,
            IngestError::Line {
                source: LineError::Parse(ParseError::Coordinate { .. }),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn out_of_canvas_coordinate_is_rejected() {
        let shards = vec![shard_2022(
            "a",
            "2022-04-01 12:00:00 UTC,u,#FFFFFF,\"2000,5\"\n",
        )];

        let err = ingest(&plain_2022(), shards, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            IngestError::Line {
                line,
                source: LineError::Build(BuildError::OutOfBounds { x, y, .. }),
                ..
            } => assert_eq!((line, x, y), (2, 2000, 5)),
            err => panic!("unexpected error: {err}"),
        }
    }

    #[tokio::test]
    async fn oversized_rectangle_is_rejected_before_expansion() {
        let shards = vec![shard_2022(
            "admin",
            "2022-04-01 12:00:00 UTC,u,#FFFFFF,\"1,1\"\n\
             2022-04-04 01:00:00 UTC,admin,#000000,\"0,0,99999,99999\"\n",
        )];

        let err = ingest(&plain_2022(), shards, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            IngestError::Line {
                shard,
                line,
                source: LineError::Build(BuildError::OutOfBounds { x, y, .. }),
                ..
            } => assert_eq!((shard, line, x, y), (0, 3, 99999, 99999)),
            err => panic!("unexpected error: {err}"),
        }
    }

    #[test]
    fn shard_bytes_are_counted_against_announced_sizes() {
        let progress = Arc::new(ByteProgress::default());
        progress.announce(Some(10));
        progress.announce(Some(5));
        progress.announce(None);

        let mut reader = CountingReader {
            inner: &b"0123456789"[..],
            progress: progress.clone(),
        };
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();

        assert_eq!(out.len(), 10);
        assert_eq!(progress.read(), 10);
        assert_eq!(progress.expected(), 15);
        assert_eq!(progress.unsized_shards.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn cancelled_ingestion_stops() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let shards = vec![shard_2022("a", &pixel_lines(10, 0))];
        let err = ingest(&plain_2022(), shards, &cancel).await.unwrap_err();
        assert!(matches!(err, IngestError::Cancelled));
    }
}
