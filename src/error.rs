use thiserror::Error;

/// API-boundary failures. Pipeline stages never raise these across stage
/// boundaries — detection failures travel as issues inside the outcome —
/// so this enum covers only input validation and external I/O.
#[derive(Error, Debug)]
pub enum DigitizeError {
    #[error("pixel buffer length mismatch: expected {expected} bytes, got {actual}")]
    InvalidBuffer { expected: usize, actual: usize },

    #[error("unknown oracle provider '{0}'")]
    UnknownProvider(String),

    #[error("oracle configuration invalid: {0}")]
    InvalidOracleConfig(String),
}
