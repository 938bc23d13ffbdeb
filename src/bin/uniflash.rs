use std::process::exit;

use clap::Parser;
use log::LevelFilter;
use miette::Result;

use uniflash::cli::{self, normalize_legacy_args, Cli};
use uniflash::logging::initialize_logger;

fn main() -> Result<()> {
    initialize_logger(LevelFilter::Info);

    let args = normalize_legacy_args(std::env::args());
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        // --help and --version are not failures; everything else is.
        Err(e) if e.use_stderr() => {
            eprint!("{e}");
            exit(1);
        }
        Err(e) => {
            print!("{e}");
            exit(0);
        }
    };

    cli::run(cli)
}
