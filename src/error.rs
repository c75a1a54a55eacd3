use thiserror::Error;

use crate::field::Precision;

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("blas has not been built for {precision:?} precision with n_spin={n_spin}")]
    Unsupported { precision: Precision, n_spin: usize },

    #[error("Location error: {0}")]
    Location(String),

    #[error("Shape mismatch: {0}")]
    Shape(String),

    #[error("Device error: {0}")]
    Device(String),
}

pub type Result<T> = std::result::Result<T, SolverError>;
