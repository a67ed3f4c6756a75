use chrono::NaiveDateTime;
use colors_transform::Color;
use csv::StringRecord;
use structures::RawEvent;

use crate::errors::ParseError;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f UTC";

pub const HEADER_2017: &str = "ts,user_hash,x_coordinate,y_coordinate,color";
pub const HEADER_2022: &str = "timestamp,user_id,pixel_color,coordinate";

/// The fixed 2017 palette, indexed by the `color` column.
pub const PALETTE_2017: [[u8; 4]; 16] = [
    [0xFF, 0xFF, 0xFF, 0xFF],
    [0xE4, 0xE4, 0xE4, 0xFF],
    [0x88, 0x88, 0x88, 0xFF],
    [0x22, 0x22, 0x22, 0xFF],
    [0xFF, 0xA7, 0xD1, 0xFF],
    [0xE5, 0x00, 0x00, 0xFF],
    [0xE5, 0x95, 0x00, 0xFF],
    [0xA0, 0x6A, 0x42, 0xFF],
    [0xE5, 0xD9, 0x00, 0xFF],
    [0x94, 0xE0, 0x44, 0xFF],
    [0x02, 0xBE, 0x01, 0xFF],
    [0x00, 0xE5, 0xF0, 0xFF],
    [0x00, 0x83, 0xC7, 0xFF],
    [0x00, 0x00, 0xEA, 0xFF],
    [0xE0, 0x4A, 0xFF, 0xFF],
    [0x82, 0x00, 0x80, 0xFF],
];

/// Inclusive rectangle of canvas coordinates with ordered corners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Area {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl Area {
    pub fn pixel(x: u32, y: u32) -> Self {
        Self::spanning(x, y, x, y)
    }

    /// The rectangle between two opposite corners, given in any order.
    pub fn spanning(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        Self {
            min_x: x1.min(x2),
            min_y: y1.min(y2),
            max_x: x1.max(x2),
            max_y: y1.max(y2),
        }
    }

    pub fn num_pixels(&self) -> u64 {
        u64::from(self.max_x - self.min_x + 1) * u64::from(self.max_y - self.min_y + 1)
    }

    /// Covered coordinates, row by row.
    pub fn coordinates(&self) -> impl Iterator<Item = (u32, u32)> {
        let Area {
            min_x,
            min_y,
            max_x,
            max_y,
        } = *self;
        (min_y..=max_y).flat_map(move |y| (min_x..=max_x).map(move |x| (x, y)))
    }
}

/// What one source line describes: a single pixel, or an admin rectangle
/// filled with one color.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub placed_at: NaiveDateTime,
    pub user: String,
    pub color: [u8; 4],
    pub area: Area,
}

impl Placement {
    /// One raw event per covered coordinate. Callers bound-check `area`
    /// first; nothing here limits its size.
    pub fn events(&self) -> impl Iterator<Item = RawEvent> + '_ {
        self.area.coordinates().map(move |(x, y)| RawEvent {
            placed_at: self.placed_at,
            user: self.user.clone(),
            x,
            y,
            color: self.color,
        })
    }
}

/// Turns one CSV record into the placement it describes, if any. Blank
/// placements yield `None`.
pub type LineParser = fn(&StringRecord) -> Result<Option<Placement>, ParseError>;

pub fn parse_timestamp(value: &str) -> Result<NaiveDateTime, ParseError> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT).map_err(|err| ParseError::Timestamp {
        value: value.to_string(),
        reason: err.to_string(),
    })
}

fn parse_coordinate(axis: &'static str, value: &str) -> Result<u32, ParseError> {
    value.trim().parse().map_err(|_| ParseError::Coordinate {
        axis,
        value: value.to_string(),
    })
}

fn check_columns(record: &StringRecord, expected: usize) -> Result<(), ParseError> {
    if record.len() != expected {
        return Err(ParseError::Columns {
            found: record.len(),
            expected,
        });
    }
    Ok(())
}

/// `ts,user_hash,x_coordinate,y_coordinate,color`
pub fn parse_line_2017(record: &StringRecord) -> Result<Option<Placement>, ParseError> {
    check_columns(record, 5)?;
    let (x, y, color) = (&record[2], &record[3], &record[4]);
    if x.is_empty() || y.is_empty() || color.is_empty() {
        return Ok(None);
    }

    let placed_at = parse_timestamp(&record[0])?;
    let x = parse_coordinate("x", x)?;
    let y = parse_coordinate("y", y)?;
    let color = color
        .parse::<usize>()
        .ok()
        .and_then(|index| PALETTE_2017.get(index))
        .copied()
        .ok_or_else(|| ParseError::Color(color.to_string()))?;

    Ok(Some(Placement {
        placed_at,
        user: record[1].to_string(),
        color,
        area: Area::pixel(x, y),
    }))
}

/// `timestamp,user_id,pixel_color,coordinate` where the coordinate is either
/// `"x,y"` or an inclusive admin rectangle `"x1,y1,x2,y2"`.
pub fn parse_line_2022(record: &StringRecord) -> Result<Option<Placement>, ParseError> {
    check_columns(record, 4)?;
    let (color_str, coordinate) = (&record[2], &record[3]);
    if color_str.is_empty() || coordinate.is_empty() {
        return Ok(None);
    }

    let placed_at = parse_timestamp(&record[0])?;
    let parsed_color = colors_transform::Rgb::from_hex_str(color_str)
        .map_err(|_| ParseError::Color(color_str.to_string()))?;
    let color = [
        parsed_color.get_red() as u8,
        parsed_color.get_green() as u8,
        parsed_color.get_blue() as u8,
        0xff,
    ];

    let parts: Vec<&str> = coordinate.split(',').collect();
    let area = match parts.as_slice() {
        [x, y] => Area::pixel(parse_coordinate("x", x)?, parse_coordinate("y", y)?),
        [x1, y1, x2, y2] => Area::spanning(
            parse_coordinate("x", x1)?,
            parse_coordinate("y", y1)?,
            parse_coordinate("x", x2)?,
            parse_coordinate("y", y2)?,
        ),
        _ => return Err(ParseError::CoordinateShape(coordinate.to_string())),
    };

    Ok(Some(Placement {
        placed_at,
        user: record[1].to_string(),
        color,
        area,
    }))
}

/// Rebuilds a printable source line from a record, for error messages.
pub fn line_text(record: &StringRecord) -> String {
    record
        .iter()
        .map(|field| {
            if field.contains(',') {
                format!("\"{field}\"")
            } else {
                field.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}
