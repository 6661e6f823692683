use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use guidance_cli::{init_tracing, run_cli, Cli};

fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    run_cli(cli).map(ExitCode::from)
}
