//! Remove command - delete a cached tile.

use super::common::tile_key;
use crate::error::CliError;
use crate::runner::CliRunner;

/// Arguments for the remove command.
pub struct RemoveArgs {
    pub layer: String,
    pub tile: String,
}

/// Run the remove command. Removing a tile that is not cached succeeds.
pub fn run(runner: &CliRunner, args: RemoveArgs) -> Result<(), CliError> {
    let layer = runner.app().layer(&args.layer)?;
    let key = tile_key(layer, &args.tile)?;

    runner.block_on(layer.cache().remove(&key))?;

    println!("Removed {}", key);
    Ok(())
}
