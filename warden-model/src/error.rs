use thiserror::Error;

/// Errors produced by model constructors and validation routines.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("invalid field: {0}")]
    InvalidField(String),

    #[error("parse error: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;
