//! luapool CLI
//!
//! Runs functions from Lua scripts through a pooled VM and benchmarks the
//! pool under concurrent load.

use luapool::cli;

#[tokio::main]
async fn main() {
    if let Err(e) = cli::run_cli().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
