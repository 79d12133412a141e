use thiserror::Error;

use crate::db::models::{PropType, Side};

/// Errors raised inside the per-prop modelling core.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Training data is empty")]
    EmptyTrainingSet,

    #[error("Side must be Over or Under, got {0}")]
    InvalidSide(Side),

    #[error("Could not find stat or target column for prop type {prop}; available columns: {available:?}")]
    UnresolvedColumn {
        prop: PropType,
        available: Vec<String>,
    },

    #[error("Classifier has already been fitted")]
    AlreadyFitted,

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
}
