//! Session command implementation
//!
//! Prints the id every container created from this process tree is labelled with.

use anyhow::Result;

pub fn execute_session() -> Result<()> {
    println!("{}", scuttle_core::session::current());
    Ok(())
}
