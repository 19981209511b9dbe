//! Write command - store a tile from a file.

use std::path::PathBuf;

use bytes::Bytes;
use tracing::debug;

use super::common::tile_key;
use crate::error::CliError;
use crate::runner::CliRunner;

/// Arguments for the write command.
pub struct WriteArgs {
    pub layer: String,
    pub tile: String,
    pub input: PathBuf,
}

/// Run the write command.
///
/// The tile is written under its lock, as a renderer would, so concurrent
/// readers waiting on the lock see the new body.
pub fn run(runner: &CliRunner, args: WriteArgs) -> Result<(), CliError> {
    let body = std::fs::read(&args.input).map_err(|source| CliError::File {
        path: args.input.clone(),
        source,
    })?;
    let body = Bytes::from(body);
    let size = body.len();

    let layer = runner.app().layer(&args.layer)?;
    let key = tile_key(layer, &args.tile)?;
    let cache = layer.cache();

    runner.block_on(async {
        let token = cache.lock(&key, layer.stale_lock_timeout()).await?;
        debug!(key = %key, "Holding lock for write");
        cache.save(&key, body, Some(&token)).await
    })?;

    println!("Wrote {} bytes to {}", size, key);
    Ok(())
}
