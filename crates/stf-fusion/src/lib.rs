//! # stf-fusion
//!
//! Fusion engines for multi-resolution satellite image time series. Given
//! co-registered coarse- and fine-resolution scenes at known pair dates and
//! a coarse scene at a target date, an engine predicts the missing
//! fine-resolution scene at that date.
//!
//! - [`StarfmFusor`] - spatio-temporal adaptive reflectance fusion, single
//!   or double pair
//! - [`EstarfmFusor`] - enhanced STARFM with local linear regression and
//!   similarity classes, two pairs
//! - [`FitFCFusor`] - regression model + spatial filter + residual
//!   compensation, single pair
//! - [`SpstfmFusor`] - sparse-representation fusion over a jointly trained
//!   high/low-resolution dictionary pair (K-SVD + GPSR)
//! - [`Parallelizer`] - tile-parallel meta engine splitting the prediction
//!   area into horizontal stripes
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use stf_core::MultiResImages;
//! use stf_fusion::{DataFusor, PairDates, StarfmFusor, StarfmOptions};
//!
//! let imgs: Arc<MultiResImages> = Arc::new(MultiResImages::new());
//! // ... fill the store with ("high", 1), ("low", 1), ("low", 2) ...
//!
//! let mut opt = StarfmOptions::default();
//! opt.high_tag = "high".into();
//! opt.low_tag = "low".into();
//! opt.pair_dates = PairDates::Single(1);
//!
//! let mut fusor = StarfmFusor::new();
//! fusor.set_src_images(imgs);
//! fusor.process_options(&opt).unwrap();
//! fusor.predict(2, None).unwrap();
//! let prediction = fusor.output();
//! ```
//!
//! Only STARFM and ESTARFM may be wrapped in the [`Parallelizer`]; Fit-FC
//! and SPSTFM depend on global context (bicubic-filtered residual, trained
//! dictionary) and parallelize internally instead. The restriction is
//! expressed through the [`TileParallel`] marker trait, so wrapping a
//! forbidden engine does not compile.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod estarfm;
pub mod fitfc;
pub mod parallel;
pub mod spstfm;
pub mod starfm;

mod preamble;

pub use estarfm::{EstarfmFusor, EstarfmOptions};
pub use fitfc::{FitFCFusor, FitFCOptions};
pub use parallel::{Parallelizer, ParallelizerOptions};
pub use spstfm::{SpstfmFusor, SpstfmOptions};
pub use starfm::{StarfmFusor, StarfmOptions};

use std::sync::Arc;
use stf_core::{Image, MultiResImages, Rect, Result};

/// The pair dates an engine predicts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PairDates {
    /// No pair date set yet; prediction fails validation.
    #[default]
    Unset,
    /// One fine/coarse pair at the given date.
    Single(i32),
    /// Two fine/coarse pairs bracketing the target date.
    Double(i32, i32),
}

impl PairDates {
    /// The dates as a small vector, empty when unset.
    pub fn dates(&self) -> Vec<i32> {
        match *self {
            PairDates::Unset => Vec::new(),
            PairDates::Single(d) => vec![d],
            PairDates::Double(a, b) => vec![a, b],
        }
    }
}

/// Common interface of all fusion engines (and the [`Parallelizer`]).
///
/// The usual call order is `set_src_images`, engine-specific
/// `process_options`, then [`predict`](DataFusor::predict); the result is
/// borrowed via [`output`](DataFusor::output) or moved out with
/// [`take_output`](DataFusor::take_output). On successive predictions the
/// output buffer is reused when size and type still match.
pub trait DataFusor {
    /// Hands the engine the (read-only) source image store.
    fn set_src_images(&mut self, imgs: Arc<MultiResImages>);

    /// Borrow of the engine-owned output buffer.
    fn output(&self) -> &Image;

    /// Moves the output buffer out, leaving an empty placeholder.
    fn take_output(&mut self) -> Image;

    /// Predicts the fine-resolution image at `date`.
    ///
    /// The optional mask marks invalid input pixels (0 = invalid,
    /// 255 = valid); output values at invalid locations are unspecified.
    fn predict(&mut self, date: i32, mask: Option<&Image>) -> Result<()>;
}

/// Marker for engines whose prediction area can be partitioned into
/// independent tiles.
///
/// Implemented by STARFM and ESTARFM. Fit-FC and SPSTFM must not implement
/// this: their output depends on global context, so the [`Parallelizer`]
/// rejects them at compile time.
pub trait TileParallel: DataFusor + Clone + Send {
    /// The currently configured prediction area (all-zero = full image).
    fn prediction_area(&self) -> Rect;

    /// Overrides the prediction area, used by the parallelizer to assign
    /// stripes.
    fn set_prediction_area(&mut self, area: Rect);
}
