//! # stf-math
//!
//! Numeric building blocks shared by the fusion engines:
//!
//! - [`window`] - 2-D moving-window sums with the additive/subtractive
//!   sliding update
//! - [`regress`] - least-squares line fits and the guarded slope used by
//!   the pairwise engines
//! - [`stats`] - masked per-channel statistics over whole images
//! - [`resample`] - area-downscale + bicubic-upscale roundtrip for the
//!   coarse residual

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod regress;
pub mod resample;
pub mod stats;
pub mod window;

pub use regress::{correlate, fit_line, regress_slope, MIN_ABS_CORRELATION};
pub use resample::area_cubic_roundtrip;
pub use stats::{
    masked_abs_diff_max, masked_abs_diff_sum, masked_diff_mean_stddev, masked_mean_stddev,
};
pub use window::{naive_window_sums, sliding_window_sums, WindowSums};
