use thiserror::Error;

#[derive(Error, Debug)]
pub enum RateioError {
    #[error("Missing column: {0}")]
    Schema(String),

    #[error("No metric entries for key: {0}")]
    UnmatchedKey(String),

    #[error("Non-finite value in share computation: {0}")]
    Computation(String),

    #[error("Conservation violated at stage {stage}: expected {expected}, got {actual}")]
    Conservation {
        stage: u32,
        expected: f64,
        actual: f64,
    },

    #[error("Invalid stage definition: {0}")]
    InvalidDefinition(String),

    #[error("Polars error: {0}")]
    Polars(#[from] polars::error::PolarsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
