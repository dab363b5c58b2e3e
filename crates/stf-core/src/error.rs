//! Error types for the fusion core.
//!
//! All library crates share this error enum. The variants mirror the failure
//! categories of the prediction preamble and the kernels:
//!
//! - [`Error::NotFound`] - a required (tag, date) image is missing
//! - [`Error::ImageKind`] - pixel kinds disagree, or a kernel was invoked on
//!   a kind outside its allowed set (carries the offending kind)
//! - [`Error::Size`] - sizes disagree, areas are empty/negative, a window or
//!   scale factor exceeds the image extent (carries the offending size)
//! - [`Error::InvalidArgument`] - an option value is out of range
//! - [`Error::Logic`] - a precondition was violated (programmer error)
//! - [`Error::Runtime`] - catch-all for unexpected state
//!
//! # Usage
//!
//! ```rust
//! use stf_core::{Error, Result, Size};
//!
//! fn check(a: Size, b: Size) -> Result<()> {
//!     if a != b {
//!         return Err(Error::size(format!("sizes differ: {a} vs {b}"), Some(b)));
//!     }
//!     Ok(())
//! }
//! ```

use crate::geom::Size;
use crate::kind::PixelKind;
use thiserror::Error;

/// Result type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the fusion core and the engines built on it.
#[derive(Debug, Error)]
pub enum Error {
    /// A required image is missing from the store.
    #[error("not found: {0}")]
    NotFound(String),

    /// Pixel kinds or channel counts disagree, or a kernel was invoked on a
    /// kind outside its allowed set.
    #[error("image kind error: {message}")]
    ImageKind {
        /// Description of the mismatch.
        message: String,
        /// The offending kind, if one can be named.
        kind: Option<PixelKind>,
    },

    /// Image or area sizes disagree, or an area is empty/negative.
    #[error("size error: {message}")]
    Size {
        /// Description of the mismatch.
        message: String,
        /// The offending size, if one can be named.
        size: Option<Size>,
    },

    /// An option or argument is out of its valid range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A precondition was violated; indicates a programming error.
    #[error("logic error: {0}")]
    Logic(String),

    /// Catch-all for unexpected state.
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Creates an [`Error::NotFound`].
    #[inline]
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Creates an [`Error::ImageKind`] with an optional offending kind.
    #[inline]
    pub fn image_kind(msg: impl Into<String>, kind: Option<PixelKind>) -> Self {
        Self::ImageKind {
            message: msg.into(),
            kind,
        }
    }

    /// Creates an [`Error::Size`] with an optional offending size.
    #[inline]
    pub fn size(msg: impl Into<String>, size: Option<Size>) -> Self {
        Self::Size {
            message: msg.into(),
            size,
        }
    }

    /// Creates an [`Error::InvalidArgument`].
    #[inline]
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Creates an [`Error::Logic`].
    #[inline]
    pub fn logic(msg: impl Into<String>) -> Self {
        Self::Logic(msg.into())
    }

    /// Creates an [`Error::Runtime`].
    #[inline]
    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    /// Returns `true` if this is a size-related error.
    #[inline]
    pub fn is_size_error(&self) -> bool {
        matches!(self, Self::Size { .. })
    }

    /// Returns `true` if this is an image-kind error.
    #[inline]
    pub fn is_kind_error(&self) -> bool {
        matches!(self, Self::ImageKind { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_context() {
        let e = Error::size("window larger than image", Some(Size::new(3, 3)));
        assert!(e.to_string().contains("window larger than image"));
        assert!(e.is_size_error());

        let e = Error::image_kind("mask must be u8", Some(PixelKind::F32));
        assert!(e.is_kind_error());
        match e {
            Error::ImageKind { kind, .. } => assert_eq!(kind, Some(PixelKind::F32)),
            _ => unreachable!(),
        }
    }
}
