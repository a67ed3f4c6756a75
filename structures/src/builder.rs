use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use chrono::NaiveDateTime;
use tracing::info;

use crate::dataset::{
    chunk_grid, make_chunks, Dataset, PixelEvent, RawEvent, CHUNK_SIZE, DATASET_VERSION,
    MAX_PALETTE_SIZE,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("coordinate ({x}, {y}) is outside the {width}x{height} canvas")]
    OutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
    #[error("color palette exceeds one byte ({max} colors)")]
    PaletteOverflow { max: usize },
    #[error("timestamp {placed_at} is too far from the epoch {epoch}")]
    TimestampOutOfRange {
        placed_at: NaiveDateTime,
        epoch: NaiveDateTime,
    },
}

/// Mutable state of a dataset under construction.
///
/// Palette and user dictionaries grow as events arrive and are frozen into
/// the dataset's arrays by `finalize`. Events are appended to their cell in
/// arrival order.
pub struct DatasetBuilder {
    dataset: Dataset,
    color_tuple_to_id: BTreeMap<[u8; 4], u8>,
    user_to_id: HashMap<String, u32>,
    num_events: usize,
}

impl DatasetBuilder {
    pub fn new(width: u32, height: u32, epoch: NaiveDateTime) -> Self {
        let (chunk_stride, _) = chunk_grid(width, height);

        Self {
            dataset: Dataset {
                version: DATASET_VERSION.to_string(),
                width,
                height,
                palette: Vec::new(),
                epoch,
                start_millis: 0,
                end_millis: 0,
                chunk_stride,
                user_ids: Vec::new(),
                chunks: make_chunks(width, height),
            },
            color_tuple_to_id: BTreeMap::new(),
            user_to_id: HashMap::new(),
            num_events: 0,
        }
    }

    pub fn num_events(&self) -> usize {
        self.num_events
    }

    /// Fails unless `(x, y)` lies on the canvas.
    pub fn check_bounds(&self, x: u32, y: u32) -> Result<(), BuildError> {
        let (width, height) = (self.dataset.width, self.dataset.height);
        if x >= width || y >= height {
            return Err(BuildError::OutOfBounds {
                x,
                y,
                width,
                height,
            });
        }
        Ok(())
    }

    pub fn add(&mut self, event: RawEvent) -> Result<(), BuildError> {
        self.check_bounds(event.x, event.y)?;

        let epoch = self.dataset.epoch;
        let delta_millis = i32::try_from(
            event
                .placed_at
                .signed_duration_since(epoch)
                .num_milliseconds(),
        )
        .map_err(|_| BuildError::TimestampOutOfRange {
            placed_at: event.placed_at,
            epoch,
        })?;

        let color_index = match self.color_tuple_to_id.get(&event.color) {
            Some(index) => *index,
            None => {
                let color_map_len = self.color_tuple_to_id.len();
                if color_map_len >= MAX_PALETTE_SIZE {
                    return Err(BuildError::PaletteOverflow {
                        max: MAX_PALETTE_SIZE,
                    });
                }
                self.color_tuple_to_id
                    .insert(event.color, color_map_len as u8);
                color_map_len as u8
            }
        };

        let users_len = self.user_to_id.len() as u32;
        let user_index = *self.user_to_id.entry(event.user).or_insert(users_len);

        let chunk_x = event.x / CHUNK_SIZE;
        let chunk_y = event.y / CHUNK_SIZE;
        let chunk = &mut self.dataset.chunks[(chunk_y * self.dataset.chunk_stride + chunk_x) as usize];
        chunk
            .cell_mut(event.x % CHUNK_SIZE, event.y % CHUNK_SIZE)
            .push(PixelEvent {
                delta_millis,
                user_index,
                color_index,
            });

        self.num_events += 1;
        Ok(())
    }

    /// Freezes the dictionaries, sorts every cell by time and computes the
    /// start and end of the history.
    ///
    /// Cells are sorted with a stable sort, so placements sharing a
    /// timestamp stay in arrival order.
    pub fn finalize(self) -> Result<Dataset, BuildError> {
        let started = Instant::now();
        let DatasetBuilder {
            mut dataset,
            color_tuple_to_id,
            user_to_id,
            num_events,
        } = self;

        if color_tuple_to_id.len() > MAX_PALETTE_SIZE {
            return Err(BuildError::PaletteOverflow {
                max: MAX_PALETTE_SIZE,
            });
        }

        dataset.palette = vec![[0; 4]; color_tuple_to_id.len()];
        for (color, index) in color_tuple_to_id {
            dataset.palette[index as usize] = color;
        }

        dataset.user_ids = vec![String::new(); user_to_id.len()];
        for (user, index) in user_to_id {
            dataset.user_ids[index as usize] = user;
        }

        let mut first = i32::MAX;
        let mut last = i32::MIN;
        for chunk in &mut dataset.chunks {
            for events in chunk.cells_mut() {
                events.sort_by_key(|event| event.delta_millis);
                first = first.min(events[0].delta_millis);
                last = last.max(events[events.len() - 1].delta_millis);
            }
        }
        if num_events > 0 {
            dataset.start_millis = first;
            dataset.end_millis = last;
        }

        info!(
            events = num_events,
            users = dataset.user_ids.len(),
            colors = dataset.palette.len(),
            epoch = %dataset.epoch,
            first_pixel = %dataset.start(),
            final_pixel = %dataset.end(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Dataset finalized"
        );

        Ok(dataset)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDate};

    use super::*;

    const RED: [u8; 4] = [0xFF, 0x00, 0x00, 0xFF];
    const BLUE: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

    fn epoch() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2022, 4, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn event(millis: i64, user: &str, x: u32, y: u32, color: [u8; 4]) -> RawEvent {
        RawEvent {
            placed_at: epoch() + Duration::milliseconds(millis),
            user: user.to_string(),
            x,
            y,
            color,
        }
    }

    #[test]
    fn dictionaries_are_assigned_in_first_seen_order() {
        let mut builder = DatasetBuilder::new(10, 10, epoch());
        builder.add(event(0, "bob", 0, 0, BLUE)).unwrap();
        builder.add(event(1, "alice", 1, 0, RED)).unwrap();
        builder.add(event(2, "bob", 2, 0, RED)).unwrap();

        let dataset = builder.finalize().unwrap();
        assert_eq!(dataset.palette, vec![BLUE, RED]);
        assert_eq!(dataset.user_ids, vec!["bob".to_string(), "alice".to_string()]);

        let events = dataset.events_at(2, 0).unwrap();
        assert_eq!(events[0].user_index, 0);
        assert_eq!(events[0].color_index, 1);
    }

    #[test]
    fn finalize_sorts_cells_and_computes_range() {
        let mut builder = DatasetBuilder::new(300, 300, epoch());
        builder.add(event(500, "a", 260, 4, RED)).unwrap();
        builder.add(event(-20, "a", 260, 4, BLUE)).unwrap();
        builder.add(event(90, "b", 1, 1, RED)).unwrap();

        let dataset = builder.finalize().unwrap();
        let deltas: Vec<i32> = dataset
            .events_at(260, 4)
            .unwrap()
            .iter()
            .map(|ev| ev.delta_millis)
            .collect();
        assert_eq!(deltas, vec![-20, 500]);
        assert_eq!(dataset.start_millis, -20);
        assert_eq!(dataset.end_millis, 500);
        assert_eq!(dataset.num_events(), 3);
        assert_eq!(dataset.validate(), Ok(()));
    }

    #[test]
    fn coordinates_map_to_chunk_and_cell() {
        let mut builder = DatasetBuilder::new(600, 600, epoch());
        builder.add(event(0, "a", 513, 258, RED)).unwrap();

        let dataset = builder.finalize().unwrap();
        let chunk = dataset.chunk_at(2, 1);
        assert_eq!(chunk.cell(1, 2).len(), 1);
        assert_eq!(chunk.width, 88);
    }

    #[test]
    fn equal_timestamps_keep_arrival_order() {
        let mut builder = DatasetBuilder::new(4, 4, epoch());
        builder.add(event(10, "late", 0, 0, RED)).unwrap();
        builder.add(event(5, "first", 0, 0, BLUE)).unwrap();
        builder.add(event(5, "second", 0, 0, RED)).unwrap();
        builder.add(event(5, "third", 0, 0, BLUE)).unwrap();

        let dataset = builder.finalize().unwrap();
        let users: Vec<&str> = dataset
            .events_at(0, 0)
            .unwrap()
            .iter()
            .map(|ev| dataset.user_ids[ev.user_index as usize].as_str())
            .collect();
        assert_eq!(users, vec!["first", "second", "third", "late"]);
    }

    #[test]
    fn out_of_bounds_coordinates_are_rejected() {
        let mut builder = DatasetBuilder::new(1001, 1001, epoch());
        let err = builder.add(event(0, "a", 1001, 3, RED)).unwrap_err();
        assert_eq!(
            err,
            BuildError::OutOfBounds {
                x: 1001,
                y: 3,
                width: 1001,
                height: 1001
            }
        );
        assert_eq!(builder.num_events(), 0);
        assert_eq!(builder.check_bounds(1000, 1000), Ok(()));
        assert!(builder.check_bounds(0, 1001).is_err());
    }

    #[test]
    fn palette_overflow_is_fatal() {
        let mut builder = DatasetBuilder::new(32, 32, epoch());
        for i in 0..256u32 {
            let color = [i as u8, 0, 0, 0xFF];
            builder.add(event(0, "a", i % 32, i / 32, color)).unwrap();
        }

        let err = builder
            .add(event(0, "a", 0, 0, [0, 1, 0, 0xFF]))
            .unwrap_err();
        assert_eq!(err, BuildError::PaletteOverflow { max: 256 });

        // Reusing a known color is still fine
        builder.add(event(1, "a", 0, 0, [7, 0, 0, 0xFF])).unwrap();
        assert_eq!(builder.finalize().unwrap().palette.len(), 256);
    }

    #[test]
    fn empty_dataset_finalizes() {
        let dataset = DatasetBuilder::new(2000, 2000, epoch()).finalize().unwrap();
        assert_eq!(dataset.num_events(), 0);
        assert_eq!(dataset.chunks.len(), 64);
        assert_eq!((dataset.start_millis, dataset.end_millis), (0, 0));
    }
}
