mod cmd;
mod config;
mod util;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use crate::config::Config;
use crate::util::logging::{setup_logging, LevelFilter};

#[derive(clap::Parser)]
#[clap(
    name = "daplink",
    about = "Program the flash of DAPLink boards through their flash algorithms",
    version
)]
struct Cli {
    /// The configuration file. Defaults to `daplink.toml` in the working directory.
    #[clap(long, global = true, env = "DAPLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Additional target description files.
    #[clap(long = "target", global = true, value_name = "PATH")]
    targets: Vec<PathBuf>,

    /// The log level. Overrides the configuration and `RUST_LOG`.
    #[clap(long, global = true, value_enum, help_heading = "LOG CONFIGURATION")]
    log_level: Option<LevelFilter>,

    #[clap(subcommand)]
    subcommand: Subcommand,
}

#[derive(clap::Subcommand)]
enum Subcommand {
    /// List all known boards
    List(cmd::list::Cmd),
    /// Show the flash layout and algorithms of a board
    Info(cmd::info::Cmd),
    /// Download a file to the simulated flash of a board
    Download(cmd::download::Cmd),
    /// Erase all flash of a board
    Erase(cmd::erase::Cmd),
}

impl Cli {
    fn run(self, config: Config) -> Result<()> {
        let registry = config.registry(&self.targets)?;
        let board = config.board.as_deref();

        match self.subcommand {
            Subcommand::List(cmd) => cmd.run(&registry),
            Subcommand::Info(cmd) => cmd.run(&registry, board),
            Subcommand::Download(cmd) => cmd.run(&registry, board, config.flashing),
            Subcommand::Erase(cmd) => cmd.run(&registry, board, config.flashing),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    setup_logging(cli.log_level.or(config.log_level))?;

    cli.run(config)
}
