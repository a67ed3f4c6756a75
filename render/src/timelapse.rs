use std::{
    borrow::Cow,
    cmp::Reverse,
    collections::BinaryHeap,
    sync::Arc,
    time::{Duration, Instant},
};

use structures::{Dataset, PixelEvent};
use tracing::info;

use crate::{errors::EncodeError, raster::Raster, tiles::palette_with_background};

/// Copies of the final frame appended so players pause on the result.
pub const TRAILER_FRAMES: usize = 100;

/// Playback speed of the encoded animations.
pub const FRAME_DELAY_NUMERATOR: u16 = 1;
pub const FRAME_DELAY_DENOMINATOR: u16 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnimationFormat {
    Gif,
    Apng,
}

impl AnimationFormat {
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension {
            "gif" => Some(Self::Gif),
            "apng" => Some(Self::Apng),
            _ => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Gif => "image/gif",
            Self::Apng => "image/apng",
        }
    }
}

/// Indexed frames of the canvas, one per time bucket, followed by the
/// trailer.
#[derive(Debug, Clone)]
pub struct Timelapse {
    pub width: u32,
    pub height: u32,
    /// Dataset palette, plus the background color if the dataset lacks it
    pub palette: Vec<[u8; 4]>,
    pub bucket: Duration,
    /// Frames rendered from the history, excluding the trailer
    pub num_rendered: usize,
    frames: Vec<Arc<[u8]>>,
}

struct CellCursor<'a> {
    offset: usize,
    events: &'a [PixelEvent],
}

impl Timelapse {
    /// Replays the history in `bucket` steps. Frame `i` shows every
    /// placement with a delta strictly below `(i + 1) * bucket`.
    pub fn render(dataset: &Dataset, bucket: Duration) -> Self {
        let started = Instant::now();
        let bucket_millis = (bucket.as_millis() as i64).max(1);
        let num_rendered = if dataset.end_millis < 0 {
            1
        } else {
            (i64::from(dataset.end_millis) / bucket_millis + 1) as usize
        };

        let (palette, background) = palette_with_background(&dataset.palette);

        let width = dataset.width as usize;
        let mut cursors: Vec<CellCursor> = dataset
            .pixels()
            .map(|(x, y, events)| CellCursor {
                offset: y as usize * width + x as usize,
                events,
            })
            .collect();
        // Next pending event of every cell, earliest first
        let mut next: BinaryHeap<Reverse<(i32, usize)>> = cursors
            .iter()
            .enumerate()
            .map(|(i, cursor)| Reverse((cursor.events[0].delta_millis, i)))
            .collect();

        let mut pixels = vec![background; width * dataset.height as usize];
        let mut frames: Vec<Arc<[u8]>> = Vec::with_capacity(num_rendered + TRAILER_FRAMES);
        for i in 0..num_rendered {
            let boundary = (i as i64 + 1) * bucket_millis;
            while let Some(&Reverse((delta_millis, cell))) = next.peek() {
                if i64::from(delta_millis) >= boundary {
                    break;
                }
                next.pop();

                let cursor = &mut cursors[cell];
                pixels[cursor.offset] = cursor.events[0].color_index;
                cursor.events = &cursor.events[1..];
                if let Some(event) = cursor.events.first() {
                    next.push(Reverse((event.delta_millis, cell)));
                }
            }
            frames.push(Arc::from(pixels.as_slice()));
        }

        if let Some(last) = frames.last().cloned() {
            frames.extend(std::iter::repeat(last).take(TRAILER_FRAMES));
        }

        info!(
            frames = num_rendered,
            bucket_ms = bucket_millis,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Timelapse frames rendered"
        );

        Self {
            width: dataset.width,
            height: dataset.height,
            palette,
            bucket,
            num_rendered,
            frames,
        }
    }

    /// Number of frames including the trailer.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame(&self, index: usize) -> Option<FrameView<'_>> {
        self.frames.get(index).map(|pixels| FrameView {
            width: self.width,
            height: self.height,
            palette: &self.palette,
            pixels,
        })
    }

    pub fn encode(&self, format: AnimationFormat) -> Result<Vec<u8>, EncodeError> {
        if self.is_empty() {
            return Err(EncodeError::NoFrames);
        }

        let started = Instant::now();
        let data = match format {
            AnimationFormat::Gif => self.encode_gif()?,
            AnimationFormat::Apng => self.encode_apng()?,
        };
        info!(
            format = format.content_type(),
            frames = self.len(),
            mib = data.len() as f64 / (1 << 20) as f64,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Timelapse encoded"
        );
        Ok(data)
    }

    fn rgb_palette(&self) -> Vec<u8> {
        self.palette
            .iter()
            .flat_map(|color| [color[0], color[1], color[2]])
            .collect()
    }

    /// Every frame is written with the timelapse palette as the global
    /// color table and no local tables, so GIF and APNG show identical
    /// indices.
    fn encode_gif(&self) -> Result<Vec<u8>, EncodeError> {
        let too_large = || EncodeError::TooLarge {
            width: self.width,
            height: self.height,
        };
        let width = u16::try_from(self.width).map_err(|_| too_large())?;
        let height = u16::try_from(self.height).map_err(|_| too_large())?;
        // GIF delays are in hundredths of a second
        let delay = 100 * FRAME_DELAY_NUMERATOR / FRAME_DELAY_DENOMINATOR;
        let transparent = self
            .palette
            .iter()
            .position(|color| color[3] == 0)
            .map(|index| index as u8);

        let mut buf = Vec::new();
        {
            let mut encoder = gif::Encoder::new(&mut buf, width, height, &self.rgb_palette())?;
            encoder.set_repeat(gif::Repeat::Infinite)?;
            for pixels in &self.frames {
                let frame = gif::Frame {
                    width,
                    height,
                    delay,
                    transparent,
                    palette: None,
                    buffer: Cow::Borrowed(&pixels[..]),
                    ..gif::Frame::default()
                };
                encoder.write_frame(&frame)?;
            }
        }
        Ok(buf)
    }

    fn encode_apng(&self) -> Result<Vec<u8>, EncodeError> {
        let rgb = self.rgb_palette();

        let mut buf = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut buf, self.width, self.height);
            encoder.set_color(png::ColorType::Indexed);
            encoder.set_depth(png::BitDepth::Eight);
            encoder.set_palette(rgb);
            if self.palette.iter().any(|color| color[3] != 0xFF) {
                let alpha: Vec<u8> = self.palette.iter().map(|color| color[3]).collect();
                encoder.set_trns(alpha);
            }
            // Zero plays loops forever
            encoder.set_animated(self.len() as u32, 0)?;
            encoder.set_frame_delay(FRAME_DELAY_NUMERATOR, FRAME_DELAY_DENOMINATOR)?;

            let mut writer = encoder.write_header()?;
            for pixels in &self.frames {
                writer.write_image_data(pixels)?;
            }
            writer.finish()?;
        }
        Ok(buf)
    }
}

/// One frame of a [`Timelapse`].
pub struct FrameView<'a> {
    width: u32,
    height: u32,
    palette: &'a [[u8; 4]],
    pixels: &'a [u8],
}

impl FrameView<'_> {
    pub fn color_index(&self, x: u32, y: u32) -> u8 {
        self.pixels[y as usize * self.width as usize + x as usize]
    }

    /// True when both views share the same pixel buffer.
    pub fn shares_pixels(&self, other: &FrameView<'_>) -> bool {
        std::ptr::eq(self.pixels, other.pixels)
    }
}

impl Raster for FrameView<'_> {
    fn bounds(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn color_at(&self, x: u32, y: u32) -> [u8; 4] {
        self.palette[self.color_index(x, y) as usize]
    }
}

/// Decodes a GIF produced by [`Timelapse::encode`] back into frames. Only
/// used to check encoder output.
#[cfg(test)]
fn decode_gif_frames(data: &[u8]) -> Vec<image::RgbaImage> {
    use std::io::Cursor;

    use image::{codecs::gif::GifDecoder, AnimationDecoder, Frame};

    GifDecoder::new(Cursor::new(data))
        .unwrap()
        .into_frames()
        .collect_frames()
        .unwrap()
        .into_iter()
        .map(Frame::into_buffer)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use crate::test_util::{dataset, BLUE, RED, WHITE};

    use super::*;

    #[test]
    fn buckets_use_exclusive_upper_edge() {
        let history = dataset(2, &[(0, 0, 0, RED), (120, 0, 0, BLUE)]);
        let timelapse = Timelapse::render(&history, Duration::from_millis(100));

        assert_eq!(timelapse.num_rendered, 2);
        assert_eq!(timelapse.frame(0).unwrap().color_at(0, 0), RED);
        assert_eq!(timelapse.frame(1).unwrap().color_at(0, 0), BLUE);
        assert_eq!(timelapse.frame(0).unwrap().color_at(1, 1), WHITE);

        let at_edge = dataset(2, &[(0, 0, 0, RED), (100, 0, 0, BLUE)]);
        let timelapse = Timelapse::render(&at_edge, Duration::from_millis(100));
        assert_eq!(timelapse.num_rendered, 2);
        assert_eq!(timelapse.frame(0).unwrap().color_at(0, 0), RED);
        assert_eq!(timelapse.frame(1).unwrap().color_at(0, 0), BLUE);
    }

    #[test]
    fn frames_accumulate_history() {
        let dataset = dataset(
            4,
            &[
                (-50, 3, 3, BLUE),
                (10, 0, 0, RED),
                (250, 1, 0, BLUE),
                (260, 0, 0, BLUE),
                (999, 2, 2, RED),
            ],
        );
        let timelapse = Timelapse::render(&dataset, Duration::from_millis(250));

        assert_eq!(timelapse.num_rendered, 4);
        let first = timelapse.frame(0).unwrap();
        assert_eq!(first.color_at(3, 3), BLUE);
        assert_eq!(first.color_at(0, 0), RED);
        assert_eq!(first.color_at(1, 0), WHITE);

        let second = timelapse.frame(1).unwrap();
        assert_eq!(second.color_at(0, 0), BLUE);
        assert_eq!(second.color_at(1, 0), BLUE);
        assert_eq!(second.color_at(2, 2), WHITE);

        assert_eq!(timelapse.frame(3).unwrap().color_at(2, 2), RED);
    }

    #[test]
    fn trailer_shares_final_frame() {
        let dataset = dataset(3, &[(0, 0, 0, RED), (450, 1, 1, BLUE)]);
        let timelapse = Timelapse::render(&dataset, Duration::from_millis(100));

        assert_eq!(timelapse.num_rendered, 5);
        assert_eq!(timelapse.len(), 5 + TRAILER_FRAMES);
        let last = timelapse.frame(4).unwrap();
        for i in 5..timelapse.len() {
            assert!(timelapse.frame(i).unwrap().shares_pixels(&last));
        }
        assert!(!timelapse.frame(3).unwrap().shares_pixels(&last));
    }

    #[test]
    fn history_before_epoch_is_a_single_frame() {
        let dataset = dataset(2, &[(-500, 0, 0, RED), (-100, 1, 0, BLUE)]);
        let timelapse = Timelapse::render(&dataset, Duration::from_secs(60));

        assert_eq!(timelapse.num_rendered, 1);
        assert_eq!(timelapse.frame(0).unwrap().color_at(1, 0), BLUE);
    }

    #[test]
    fn background_joins_palette_when_missing() {
        let red_only = dataset(2, &[(0, 0, 0, RED)]);
        let timelapse = Timelapse::render(&red_only, Duration::from_millis(10));
        assert_eq!(timelapse.palette, vec![RED, WHITE]);
        assert_eq!(timelapse.frame(0).unwrap().color_index(1, 1), 1);

        let with_white = dataset(2, &[(0, 0, 0, WHITE), (1, 1, 1, RED)]);
        let timelapse = Timelapse::render(&with_white, Duration::from_millis(10));
        assert_eq!(timelapse.palette, vec![WHITE, RED]);
    }

    #[test]
    fn apng_declares_every_frame() {
        let dataset = dataset(4, &[(0, 0, 0, RED), (150, 3, 3, BLUE)]);
        let timelapse = Timelapse::render(&dataset, Duration::from_millis(100));
        let data = timelapse.encode(AnimationFormat::Apng).unwrap();

        let decoder = png::Decoder::new(Cursor::new(data.as_slice()));
        let reader = decoder.read_info().unwrap();
        let control = reader.info().animation_control.unwrap();
        assert_eq!(control.num_frames as usize, 2 + TRAILER_FRAMES);
        assert_eq!(control.num_plays, 0);
        assert_eq!(reader.info().width, 4);
    }

    #[test]
    fn gif_round_trips_frames() {
        let dataset = dataset(4, &[(0, 0, 0, RED), (150, 3, 3, BLUE)]);
        let timelapse = Timelapse::render(&dataset, Duration::from_millis(100));
        let data = timelapse.encode(AnimationFormat::Gif).unwrap();

        let frames = decode_gif_frames(&data);
        assert_eq!(frames.len(), 2 + TRAILER_FRAMES);
        assert_eq!(frames[0].get_pixel(0, 0).0, RED);
        assert_eq!(frames[0].get_pixel(3, 3).0, WHITE);
        assert_eq!(frames[1].get_pixel(3, 3).0, BLUE);
    }

    #[test]
    fn gif_uses_the_timelapse_palette() {
        let dataset = dataset(4, &[(0, 0, 0, RED), (150, 3, 3, BLUE), (160, 1, 2, RED)]);
        let timelapse = Timelapse::render(&dataset, Duration::from_millis(100));
        let data = timelapse.encode(AnimationFormat::Gif).unwrap();

        let mut options = gif::DecodeOptions::new();
        options.set_color_output(gif::ColorOutput::Indexed);
        let mut decoder = options.read_info(Cursor::new(data.as_slice())).unwrap();

        // Tables are padded to a power of two
        let global = decoder.global_palette().unwrap().to_vec();
        assert!(global.starts_with(&timelapse.rgb_palette()));

        let mut count = 0;
        while let Some(frame) = decoder.read_next_frame().unwrap() {
            assert!(frame.palette.is_none(), "frame {count} has a local palette");
            let expected = timelapse.frame(count).unwrap();
            assert_eq!(&frame.buffer[..], expected.pixels, "frame {count}");
            count += 1;
        }
        assert_eq!(count, timelapse.len());
    }

    #[test]
    fn encoding_is_deterministic() {
        let dataset = dataset(8, &[(0, 0, 0, RED), (30, 7, 7, BLUE), (70, 4, 4, RED)]);
        let first = Timelapse::render(&dataset, Duration::from_millis(25));
        let second = Timelapse::render(&dataset, Duration::from_millis(25));

        assert_eq!(
            first.encode(AnimationFormat::Apng).unwrap(),
            second.encode(AnimationFormat::Apng).unwrap()
        );
        assert_eq!(
            first.encode(AnimationFormat::Gif).unwrap(),
            second.encode(AnimationFormat::Gif).unwrap()
        );
    }
}
