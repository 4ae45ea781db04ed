//! Error types for kiln-core operations.
//!
//! The [`Error`] enum covers the failure modes of the pure descriptor layer:
//! - Image type validation (format/channel mismatches, bad dimensions)
//! - Function metadata decoding
//! - Configuration loading
//!
//! # Usage
//!
//! ```rust
//! use kiln_core::{Error, ImageType, Result};
//!
//! fn check(image_type: ImageType) -> Result<()> {
//!     if !image_type.is_format_valid() {
//!         return Err(Error::invalid_image_type(image_type, "channel count does not match format"));
//!     }
//!     Ok(())
//! }
//! # assert!(check(ImageType::RGBA8UI_NORM).is_ok());
//! ```

use thiserror::Error;

use crate::image_type::ImageType;

/// Result type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the descriptor layer.
#[derive(Debug, Error)]
pub enum Error {
    /// The image type word is inconsistent (format vs. channel count, missing dim, ...).
    #[error("invalid image type {image_type}: {reason}")]
    InvalidImageType {
        /// Offending image type
        image_type: ImageType,
        /// Why it was rejected
        reason: String,
    },

    /// Image dimensions do not fit the image type.
    ///
    /// Returned for zero extents, non-square cube faces, or extents that
    /// overflow the size computation.
    #[error("invalid image dimensions {dim:?}: {reason}")]
    InvalidDimensions {
        /// Requested dimensions (x, y, z, w)
        dim: [u32; 4],
        /// Reason why the dimensions are invalid
        reason: String,
    },

    /// A packed metadata word carried an out-of-range field.
    #[error("invalid {field} value {value}")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// Raw value
        value: u64,
    },

    /// Configuration could not be parsed.
    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),

    /// I/O error while reading configuration.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with custom message.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Creates an [`Error::InvalidImageType`] error.
    #[inline]
    pub fn invalid_image_type(image_type: ImageType, reason: impl Into<String>) -> Self {
        Self::InvalidImageType {
            image_type,
            reason: reason.into(),
        }
    }

    /// Creates an [`Error::InvalidDimensions`] error.
    #[inline]
    pub fn invalid_dimensions(dim: glam::UVec4, reason: impl Into<String>) -> Self {
        Self::InvalidDimensions {
            dim: dim.to_array(),
            reason: reason.into(),
        }
    }

    /// Creates an [`Error::InvalidField`] error.
    #[inline]
    pub fn invalid_field(field: &'static str, value: u64) -> Self {
        Self::InvalidField { field, value }
    }

    /// Creates an [`Error::Other`] error.
    #[inline]
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Returns `true` if this error came from validating a descriptor.
    #[inline]
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidImageType { .. } | Self::InvalidDimensions { .. } | Self::InvalidField { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_image_type_message() {
        let err = Error::invalid_image_type(ImageType::RGBA8UI_NORM, "bad");
        assert!(err.to_string().contains("bad"));
        assert!(err.is_validation_error());
    }

    #[test]
    fn test_invalid_dimensions() {
        let err = Error::invalid_dimensions(glam::UVec4::new(0, 4, 0, 0), "zero width");
        let msg = err.to_string();
        assert!(msg.contains("zero width"));
        assert!(msg.contains("[0, 4, 0, 0]"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "config missing");
        let err: Error = io_err.into();
        assert!(!err.is_validation_error());
        assert!(err.to_string().contains("config missing"));
    }
}
