pub mod normal;

use clap::{Parser, Subcommand};

pub use normal::{Estimator, NormalArgs};

#[derive(Parser)]
#[command(name = "candle-klqp")]
#[command(about = "Black-box KL(q||p) variational inference with candle")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fit the posterior mean of a normal model with known noise
    Normal(NormalArgs),
}
