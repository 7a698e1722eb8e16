#![forbid(unsafe_code)]

//! Binary entrypoint that wires the Hauler services together and
//! launches the worker loops.

mod bootstrap;

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    bootstrap::run_app().await
}
