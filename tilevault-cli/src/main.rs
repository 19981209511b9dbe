//! TileVault CLI - Command-line interface
//!
//! Reads, writes and removes tiles in the cache described by a TileVault
//! config file.

mod commands;
mod error;
mod runner;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use commands::clean::CleanArgs;
use commands::read::ReadArgs;
use commands::remove::RemoveArgs;
use commands::write::WriteArgs;
use runner::CliRunner;

#[derive(Debug, Parser)]
#[command(name = "tilevault", version, about = "Operate on a TileVault tile cache")]
struct Cli {
    /// Config file (defaults to <config dir>/tilevault/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log debug output and enable verbose cache logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print a cached tile, or write it to a file
    Read {
        /// Layer name
        layer: String,
        /// Tile path, e.g. 12/656/1582.png
        tile: String,
        /// Write the tile body here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Store a tile from a file, holding the tile lock while writing
    Write {
        /// Layer name
        layer: String,
        /// Tile path, e.g. 12/656/1582.png
        tile: String,
        /// File holding the tile body
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Remove a cached tile
    Remove {
        /// Layer name
        layer: String,
        /// Tile path, e.g. 12/656/1582.png
        tile: String,
    },

    /// Remove every tile named in a tile list
    Clean {
        /// Layer name, or ALL for every configured layer
        layer: String,
        /// File with one z/x/y[.ext] tile per line
        #[arg(long)]
        tile_list: PathBuf,
        /// Extension for lines that do not carry one
        #[arg(short, long, default_value = "png")]
        extension: String,
    },

    /// List configured layers
    Layers,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), error::CliError> {
    let runner = CliRunner::new(cli.config, cli.verbose)?;

    match cli.command {
        Commands::Read {
            layer,
            tile,
            output,
        } => commands::read::run(&runner, ReadArgs { layer, tile, output }),
        Commands::Write { layer, tile, input } => {
            commands::write::run(&runner, WriteArgs { layer, tile, input })
        }
        Commands::Remove { layer, tile } => {
            commands::remove::run(&runner, RemoveArgs { layer, tile })
        }
        Commands::Clean {
            layer,
            tile_list,
            extension,
        } => commands::clean::run(
            &runner,
            CleanArgs {
                layer,
                tile_list,
                extension,
            },
        ),
        Commands::Layers => commands::layers::run(&runner),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_read() {
        let cli = Cli::try_parse_from([
            "tilevault",
            "--config",
            "/etc/tilevault.json",
            "read",
            "roads",
            "12/656/1582.png",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("/etc/tilevault.json")));
        assert!(matches!(
            cli.command,
            Commands::Read { ref layer, ref tile, output: None } if layer == "roads" && tile == "12/656/1582.png"
        ));
    }

    #[test]
    fn test_parse_clean_defaults_extension() {
        let cli =
            Cli::try_parse_from(["tilevault", "clean", "ALL", "--tile-list", "tiles.txt", "-v"])
                .unwrap();

        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Clean { ref extension, .. } if extension == "png"
        ));
    }

    #[test]
    fn test_write_requires_input() {
        assert!(Cli::try_parse_from(["tilevault", "write", "roads", "1/0/0.png"]).is_err());
    }
}
