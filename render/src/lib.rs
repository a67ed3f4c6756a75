mod errors;
mod raster;
pub mod tiles;
pub mod timelapse;

pub use crate::errors::{EncodeError, TileError};
pub use crate::raster::{encode_png, Raster};
pub use crate::tiles::{TileRequest, TileSnapshot, TileWindow};
pub use crate::timelapse::{AnimationFormat, FrameView, Timelapse};

#[cfg(test)]
pub(crate) mod test_util {
    use chrono::{Duration, NaiveDate, NaiveDateTime};
    use structures::{Dataset, DatasetBuilder, RawEvent};

    pub const WHITE: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];
    pub const RED: [u8; 4] = [0xFF, 0x00, 0x00, 0xFF];
    pub const BLUE: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

    pub fn epoch() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2017, 4, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    /// `(millis, x, y, color)` placements on a `size` x `size` canvas.
    pub fn dataset(size: u32, events: &[(i64, u32, u32, [u8; 4])]) -> Dataset {
        let mut builder = DatasetBuilder::new(size, size, epoch());
        for &(millis, x, y, color) in events {
            builder
                .add(RawEvent {
                    placed_at: epoch() + Duration::milliseconds(millis),
                    user: "tester".to_string(),
                    x,
                    y,
                    color,
                })
                .unwrap();
        }
        builder.finalize().unwrap()
    }
}
