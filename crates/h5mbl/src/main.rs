mod cli;
mod logging;
mod run;

use anyhow::Result;
use clap::Parser;

use crate::cli::Cli;

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbosity, cli.store_verbosity);
    run::run(cli)
}
