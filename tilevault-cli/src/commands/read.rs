//! Read command - fetch a cached tile.

use std::io::Write;
use std::path::PathBuf;

use bytes::Bytes;

use super::common::tile_key;
use crate::error::CliError;
use crate::runner::CliRunner;

/// Arguments for the read command.
pub struct ReadArgs {
    pub layer: String,
    pub tile: String,
    pub output: Option<PathBuf>,
}

/// Read a tile body from the cache.
pub fn fetch(runner: &CliRunner, layer: &str, tile: &str) -> Result<Bytes, CliError> {
    let layer = runner.app().layer(layer)?;
    let key = tile_key(layer, tile)?;

    runner
        .block_on(layer.cache().read(&key))?
        .ok_or_else(|| CliError::NotCached(key.to_string()))
}

/// Run the read command.
pub fn run(runner: &CliRunner, args: ReadArgs) -> Result<(), CliError> {
    let body = fetch(runner, &args.layer, &args.tile)?;

    match args.output {
        Some(path) => {
            std::fs::write(&path, &body).map_err(|source| CliError::File {
                path: path.clone(),
                source,
            })?;
            eprintln!("Wrote {} bytes to {}", body.len(), path.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(&body)
                .and_then(|()| stdout.flush())
                .map_err(|source| CliError::File {
                    path: PathBuf::from("<stdout>"),
                    source,
                })?;
        }
    }

    Ok(())
}
