//! # stf-core
//!
//! Core types for spatio-temporal satellite image fusion.
//!
//! This crate provides the foundation the fusion engines are built on:
//!
//! - [`PixelKind`] / [`Scalar`] / [`dispatch_kind!`] - runtime pixel kinds
//!   bridged to compile-time monomorphized kernels
//! - [`Image`] - dynamic, shareable, croppable 2-D pixel buffer
//! - [`Rect`], [`Size`], [`Point`] - signed geometry for windows and areas
//! - [`mask`] - 0/255 validity masks and value-interval utilities
//! - [`MultiResImages`] - (resolution tag, date) → image store
//! - [`Error`] / [`Result`] - the shared error model
//!
//! ## Crate Structure
//!
//! `stf-core` has no internal dependencies; the rest of the workspace builds
//! on it:
//!
//! ```text
//! stf-core (this crate)
//!    ^
//!    |
//!    +-- stf-math   (sliding sums, regression, resampling)
//!    +-- stf-fusion (STARFM, ESTARFM, Fit-FC, SPSTFM, parallelizer)
//!    +-- stf-interp (cloud-gap interpolation)
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod geom;
pub mod image;
pub mod kind;
pub mod mask;
pub mod store;

pub use error::{Error, Result};
pub use geom::{Point, Rect, Size};
pub use image::{Image, Storable};
pub use kind::{ensure_kind_in, round_ties_even, PixelKind, Scalar, ALL_KINDS, MAX_CHANNELS};
pub use mask::Interval;
pub use store::MultiResImages;
