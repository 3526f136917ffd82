use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    daily_state_tracker_cli::init_tracing();
    let cli = daily_state_tracker_cli::Cli::parse();
    daily_state_tracker_cli::run_cli(cli)
}
