pub mod cli;
pub mod klqp;

pub use candle_core;
pub use candle_nn;
