use anyhow::Result;
use candle_klqp::cli::{normal, Cli, Commands};
use clap::Parser;

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Normal(args) => {
            normal::run(args)?;
        }
    }

    Ok(())
}
