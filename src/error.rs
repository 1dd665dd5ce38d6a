//! Error types for tensor, layer and graph operations

use thiserror::Error;

use crate::ml::Shape;

/// Errors raised by tensor views, network functions and the computation graph.
#[derive(Debug, Error)]
pub enum MlError {
    /// Operand tensors have incompatible dimensions
    #[error("Shape mismatch in {operation}: expected {expected}, got {actual}")]
    ShapeMismatch {
        operation: &'static str,
        expected: Shape,
        actual: Shape,
    },

    /// A required input (buffered forward value, head tensor, output) is absent
    #[error("Missing input: {0}")]
    MissingInput(String),

    /// The operation does not support tensors of this shape
    #[error("Unsupported shape in {operation}: {shape}")]
    UnsupportedShape {
        operation: &'static str,
        shape: Shape,
    },

    /// Caller supplied an argument the operation cannot accept
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Persisted tensor file is corrupt or of an unknown format
    #[error("Invalid tensor file: {0}")]
    InvalidFormat(String),

    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for this crate
pub type Result<T> = std::result::Result<T, MlError>;
