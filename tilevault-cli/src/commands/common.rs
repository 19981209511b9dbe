//! Common helpers shared across CLI commands.

use tilevault::cache::TileKey;
use tilevault::coord::{parse_tile_path, TileCoord};
use tilevault::layer::Layer;

use crate::error::CliError;

/// Parse a `z/x/y.ext` argument; the extension is required.
pub fn parse_tile(tile: &str) -> Result<(TileCoord, String), CliError> {
    let path = parse_tile_path(tile).map_err(|source| CliError::InvalidTile {
        tile: tile.to_string(),
        source,
    })?;

    match path.extension {
        Some(ext) => Ok((path.coord, ext)),
        None => Err(CliError::MissingExtension(tile.trim().to_string())),
    }
}

/// Cache key for a tile argument on `layer`.
pub fn tile_key(layer: &Layer, tile: &str) -> Result<TileKey, CliError> {
    let (coord, ext) = parse_tile(tile)?;
    Ok(layer.key(coord, &ext)?)
}
