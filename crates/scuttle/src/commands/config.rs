//! Config command implementation
//!
//! Prints the effective configuration (defaults, `~/.scuttle.toml`, `SCUTTLE_*`
//! environment) as pretty JSON on stdout.

use anyhow::{Context, Result};
use tracing::instrument;

#[instrument]
pub fn execute_config() -> Result<()> {
    let config = scuttle_core::config::read()?;
    let rendered =
        serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;
    println!("{}", rendered);
    Ok(())
}
