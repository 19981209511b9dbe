//! Clean command - remove every tile named in a tile list.

use std::path::PathBuf;

use tracing::{info, warn};

use tilevault::coord::{parse_tile_path, TileCoord};
use tilevault::layer::Layer;

use crate::error::CliError;
use crate::runner::CliRunner;

/// Layer name selecting every configured layer.
pub const ALL_LAYERS: &str = "ALL";

/// Arguments for the clean command.
pub struct CleanArgs {
    pub layer: String,
    pub tile_list: PathBuf,
    pub extension: String,
}

/// Tiles read from a tile list.
#[derive(Debug, Default)]
pub struct TileList {
    pub tiles: Vec<(TileCoord, String)>,
    /// Lines that could not be parsed.
    pub invalid: Vec<String>,
}

/// Parse a tile list: one `z/x/y[.ext]` per line, `#` starts a comment.
///
/// Lines without an extension get `default_extension`.
pub fn parse_tile_list(contents: &str, default_extension: &str) -> TileList {
    let mut list = TileList::default();

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match parse_tile_path(line) {
            Ok(path) => {
                let ext = path
                    .extension
                    .unwrap_or_else(|| default_extension.to_string());
                list.tiles.push((path.coord, ext));
            }
            Err(e) => {
                warn!(line = %line, error = %e, "Skipping tile list entry");
                list.invalid.push(line.to_string());
            }
        }
    }

    list
}

/// Layers a clean run applies to.
fn select_layers<'a>(runner: &'a CliRunner, name: &str) -> Result<Vec<&'a Layer>, CliError> {
    let app = runner.app();
    if name == ALL_LAYERS && app.layer(name).is_err() {
        return Ok(app.layers().collect());
    }
    Ok(vec![app.layer(name)?])
}

/// Run the clean command.
pub fn run(runner: &CliRunner, args: CleanArgs) -> Result<(), CliError> {
    let contents = std::fs::read_to_string(&args.tile_list).map_err(|source| CliError::File {
        path: args.tile_list.clone(),
        source,
    })?;
    let list = parse_tile_list(&contents, &args.extension);

    for layer in select_layers(runner, &args.layer)? {
        let mut removed = 0usize;
        for (coord, ext) in &list.tiles {
            let key = layer.key(*coord, ext)?;
            runner.block_on(layer.cache().remove(&key))?;
            removed += 1;
        }

        info!(layer = %layer.name(), removed, "Cleaned layer");
        println!("{}: removed {} tiles", layer.name(), removed);
    }

    if !list.invalid.is_empty() {
        println!("Skipped {} unreadable lines", list.invalid.len());
    }
    Ok(())
}
