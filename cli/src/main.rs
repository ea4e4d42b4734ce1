mod arg_parser;
mod session;

use arg_parser::ArgParser;
use session::Session;

use clap::Parser;
use std::{error, io, process};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<(), Box<dyn error::Error>> {
    let args = ArgParser::parse();

    // RUST_LOG wins; otherwise -d j turns on the scheduler's trace.
    let default = if args.debug_flag('j') { "makejobs=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();

    let status = match Session::new(args)?.run() {
        Ok(status) => status,
        Err(e) => {
            eprintln!("mkjobs: {}", e);
            1
        }
    };
    if status != 0 {
        process::exit(status);
    }
    Ok(())
}
