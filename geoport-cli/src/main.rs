//! Entry point for the command-line interface.
#![forbid(unsafe_code)]

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn main() {
    if let Err(err) = init_logging() {
        eprintln!("geoport: {err}");
        std::process::exit(1);
    }
    if let Err(err) = geoport_cli::run() {
        eprintln!("geoport: {err}");
        std::process::exit(1);
    }
}

/// Route `tracing` events and `log` records to stderr, filtered by `RUST_LOG`.
fn init_logging() -> eyre::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .try_init()?;
    Ok(())
}
