use thiserror::Error;

/// Errors reported by the graph compiler and its backend.
#[derive(Debug, Error)]
pub enum NnError {
    /// A runtime method was called out of order, e.g. before `compile` succeeded.
    #[error("usage error: {0}")]
    UsageSequence(String),
    /// A kernel name or file that was asked for does not exist.
    #[error("resource not found: {0}")]
    ResourceNotFound(String),
    /// A byte range or auxiliary index falls outside the target's capacity.
    #[error("out of range: {0}")]
    Range(String),
    /// Kernel compilation, allocation or enqueue failed on the device.
    #[error("device error: {0}")]
    Device(String),
    /// Operator wiring or shapes are inconsistent.
    #[error("invalid graph: {0}")]
    Graph(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl NnError {
    pub(crate) fn not_initialized() -> Self {
        NnError::UsageSequence("graph not initialized".to_string())
    }
}

pub type Result<T, E = NnError> = std::result::Result<T, E>;
