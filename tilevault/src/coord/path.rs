//! Tile path parsing.
//!
//! Parses tile paths in the conventional `{zoom}/{column}/{row}.{ext}` form
//! used by tile URLs and tile list files:
//!
//! - `12/656/1582.png`
//! - `0/0/0.json`
//!
//! The extension is optional so bare coordinate lists (`12/656/1582`) can be
//! read too; callers supply a default extension in that case.

use regex::Regex;
use std::sync::OnceLock;

use super::{CoordError, TileCoord};

/// Parsed tile path: a coordinate and an optional extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePath {
    /// The tile coordinate.
    pub coord: TileCoord,
    /// File extension without the leading dot, if one was present.
    pub extension: Option<String>,
}

/// Error parsing a tile path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Path doesn't match the `z/x/y[.ext]` pattern
    InvalidPattern(String),
    /// A component did not fit its integer type
    InvalidNumber(String),
    /// Parsed numbers don't form a valid tile
    InvalidCoord(CoordError),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::InvalidPattern(s) => {
                write!(f, "Tile path doesn't match z/x/y.ext pattern: {}", s)
            }
            ParseError::InvalidNumber(s) => write!(f, "Invalid tile path number: {}", s),
            ParseError::InvalidCoord(e) => write!(f, "Invalid tile coordinate: {}", e),
        }
    }
}

impl std::error::Error for ParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ParseError::InvalidCoord(e) => Some(e),
            _ => None,
        }
    }
}

/// Tile path pattern.
///
/// We capture:
/// - Group 1: zoom
/// - Group 2: column
/// - Group 3: row
/// - Group 4: optional extension (alphanumeric)
fn tile_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        // Leading slash tolerated so URL path tails parse as well
        Regex::new(r"^/?(\d+)/(\d+)/(\d+)(?:\.([A-Za-z0-9]+))?$").unwrap()
    })
}

/// Parse a `z/x/y[.ext]` tile path.
///
/// # Examples
///
/// ```
/// use tilevault::coord::parse_tile_path;
///
/// let path = parse_tile_path("12/656/1582.png").unwrap();
/// assert_eq!(path.coord.zoom, 12);
/// assert_eq!(path.coord.column, 656);
/// assert_eq!(path.coord.row, 1582);
/// assert_eq!(path.extension.as_deref(), Some("png"));
/// ```
pub fn parse_tile_path(input: &str) -> Result<TilePath, ParseError> {
    let trimmed = input.trim();
    let captures = tile_pattern()
        .captures(trimmed)
        .ok_or_else(|| ParseError::InvalidPattern(trimmed.to_string()))?;

    // Groups 1-3 are mandatory in the pattern
    let zoom = parse_number::<u8>(&captures[1])?;
    let column = parse_number::<u32>(&captures[2])?;
    let row = parse_number::<u32>(&captures[3])?;

    let coord = TileCoord::new(zoom, column, row).map_err(ParseError::InvalidCoord)?;
    let extension = captures.get(4).map(|m| m.as_str().to_string());

    Ok(TilePath { coord, extension })
}

fn parse_number<T: std::str::FromStr>(s: &str) -> Result<T, ParseError> {
    s.parse::<T>()
        .map_err(|_| ParseError::InvalidNumber(s.to_string()))
}
