//! Tile coordinate model.
//!
//! Tiles are addressed in the usual slippy-map grid: at zoom `z` there are
//! `2^z` columns and `2^z` rows, with column 0 at the antimeridian and row 0
//! at the north edge. The cache layer never converts these to geographic
//! coordinates; it only needs them to be valid grid positions so that every
//! addressing policy maps them to distinct storage locations.

mod path;

pub use path::{parse_tile_path, ParseError, TilePath};

use std::fmt;

use thiserror::Error;

/// Minimum supported zoom level.
pub const MIN_ZOOM: u8 = 0;

/// Maximum supported zoom level.
///
/// Quadtile addressing needs `zoom + 1` bits per axis, so 30 keeps every
/// coordinate within a `u32`.
pub const MAX_ZOOM: u8 = 30;

/// Errors from constructing a tile coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordError {
    /// Zoom level is beyond [`MAX_ZOOM`].
    #[error("Invalid zoom level: {0} (max: {max})", max = MAX_ZOOM)]
    InvalidZoom(u8),

    /// Column is outside the grid for this zoom.
    #[error("Column {column} out of range for zoom {zoom}")]
    ColumnOutOfRange { column: u32, zoom: u8 },

    /// Row is outside the grid for this zoom.
    #[error("Row {row} out of range for zoom {zoom}")]
    RowOutOfRange { row: u32, zoom: u8 },
}

/// A single tile position in the zoom/column/row grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoord {
    /// Zoom level
    pub zoom: u8,
    /// Column (X, increases eastward)
    pub column: u32,
    /// Row (Y, increases southward)
    pub row: u32,
}

impl TileCoord {
    /// Create a validated tile coordinate.
    ///
    /// # Errors
    ///
    /// Returns [`CoordError`] if the zoom exceeds [`MAX_ZOOM`] or the column
    /// or row fall outside the `2^zoom` grid.
    pub fn new(zoom: u8, column: u32, row: u32) -> Result<Self, CoordError> {
        if zoom > MAX_ZOOM {
            return Err(CoordError::InvalidZoom(zoom));
        }

        let n = Self::grid_size(zoom);
        if u64::from(column) >= n {
            return Err(CoordError::ColumnOutOfRange { column, zoom });
        }
        if u64::from(row) >= n {
            return Err(CoordError::RowOutOfRange { row, zoom });
        }

        Ok(Self { zoom, column, row })
    }

    /// Number of columns (and rows) at the given zoom level.
    #[inline]
    pub fn grid_size(zoom: u8) -> u64 {
        1u64 << zoom
    }

    /// Quadkey digits for this tile, one digit per bit of `zoom + 1` bits.
    ///
    /// Each digit is `2 * row_bit + column_bit`, most significant first. The
    /// leading digit is always `0` for in-range tiles, which keeps the string
    /// length at `zoom + 1` so zoom 0 still produces a non-empty name.
    pub fn quadkey(&self) -> String {
        (0..=self.zoom)
            .rev()
            .map(|bit| {
                let x = (self.column >> bit) & 1;
                let y = (self.row >> bit) & 1;
                char::from(b'0' + (y * 2 + x) as u8)
            })
            .collect()
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.column, self.row)
    }
}
