use clap::Parser;

mod cli;
mod commands;
mod exit_codes;
mod output;

use cli::{Cli, Command};

/// Environment variable holding an env_logger filter, used when no -v is given
const LOG_ENV: &str = "XCORR_LOG";

/// Verbosity raises the level of the xcorr targets only; other crates stay at warn
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::new();
    match std::env::var(LOG_ENV) {
        Ok(filters) if verbose == 0 => {
            builder.parse_filters(&filters);
        }
        _ => {
            builder
                .filter_level(log::LevelFilter::Warn)
                .filter_module("xcorr_core", level)
                .filter_module("xcorr", level);
        }
    }
    builder.format_timestamp_millis().init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let exit_code = match cli.command {
        Command::Run(args) => commands::run::execute(args).await,
        Command::Info(args) => commands::info::execute(args),
        Command::Modes(args) => commands::modes::execute(args),
    };

    log::debug!("Exiting with code {}", exit_code);
    std::process::exit(exit_code);
}
