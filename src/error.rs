use thiserror::Error;

/// Failures of the numeric core. Every variant aborts the whole run; a
/// degenerate draw on its own is never an error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizerError {
    #[error("insufficient history: {available} aligned observations, at least {required} required")]
    InsufficientHistory { available: usize, required: usize },

    #[error("misaligned price data: {0}")]
    MisalignedData(String),

    #[error("non-finite input for asset {asset} at period {period}: {value}")]
    NonFiniteInput {
        asset: usize,
        period: usize,
        value: f64,
    },

    #[error("no viable allocation: all {draws} draws had zero or non-finite volatility")]
    NoViableAllocation { draws: usize },

    #[error("search cancelled after {completed_draws} draws")]
    Cancelled { completed_draws: usize },

    #[error("invalid optimizer configuration: {0}")]
    InvalidConfig(String),
}

