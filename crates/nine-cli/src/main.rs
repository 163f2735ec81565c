//! # nine - 9ML code generation from the command line
//!
//! Imports NMODL mechanisms, inspects dynamics documents and builds cell
//! classes for the NEURON and NEST simulators.

use clap::Parser;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nine_cli::error::CliResult;
use nine_cli::NineCli;

#[tokio::main]
async fn main() -> CliResult<()> {
    // Parse CLI arguments
    let cli = NineCli::parse();

    // RUST_LOG wins; --verbose lowers the default to debug
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    // Execute the command
    if let Err(err) = cli.execute().await {
        error!("Command failed: {}", err);
        std::process::exit(1);
    }

    Ok(())
}
