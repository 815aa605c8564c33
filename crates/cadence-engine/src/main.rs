//! # Cadence
//!
//! Command-line audio player built on the Cadence engine.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cadence_engine::app::{self, PlayerOptions};

/// Main entry point.
fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("cadence=info".parse()?))
        .init();

    let options = PlayerOptions::parse();

    info!("Cadence {} starting", env!("CARGO_PKG_VERSION"));
    app::run(&options)?;
    info!("Cadence shutdown complete");
    Ok(())
}
