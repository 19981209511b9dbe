//! Layers command - list configured layers.

use crate::error::CliError;
use crate::runner::CliRunner;

/// Run the layers command.
pub fn run(runner: &CliRunner) -> Result<(), CliError> {
    let app = runner.app();
    println!("Cache: {}", app.cache().backend());

    let mut any = false;
    for layer in app.layers() {
        any = true;
        println!(
            "  {:<24} stale lock timeout {:>4}s  write cache {}",
            layer.name(),
            layer.stale_lock_timeout().as_secs(),
            if layer.write_cache() { "yes" } else { "no" }
        );
    }

    if !any {
        println!("  (no layers configured)");
    }
    Ok(())
}
