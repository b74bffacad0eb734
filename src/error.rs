//! Crate-level error for probe operations.

use thiserror::Error;

use crate::api::errors::ApiError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    /// Caller passed an empty identifier or a non-positive parameter.
    /// Raised before any network call.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl ProbeError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}
