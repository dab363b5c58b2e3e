//! Tile-parallel meta engine.
//!
//! [`Parallelizer`] wraps any [`TileParallel`] engine and splits the
//! prediction area into horizontal stripes of near-equal height, one worker
//! clone per stripe. Workers share the read-only image store and mask; each
//! predicts into its own output, which is then blitted into the parent
//! output stripe after the join.
//!
//! Stripe boundaries are integer rows obtained with half-even rounding of
//! the ideal fractional boundaries, so the partition is deterministic given
//! (prediction area, thread count), and the result is bit-identical to a
//! serial prediction because every stripe is an independent prediction
//! area.
//!
//! Errors raised inside stripes are captured per worker; after the join
//! exactly one is returned, preferring later stripes.

use crate::preamble;
use crate::{DataFusor, TileParallel};
use rayon::prelude::*;
use std::sync::Arc;
use stf_core::{round_ties_even, Error, Image, MultiResImages, Point, Rect, Result};

/// Options of the [`Parallelizer`].
#[derive(Debug, Clone)]
pub struct ParallelizerOptions {
    /// Prediction area; the all-zero sentinel means the full image. The
    /// prediction area of the wrapped engine's own options is ignored.
    pub prediction_area: Rect,
    /// Number of worker stripes; 0 means the number of available hardware
    /// threads. Reduced to the area height when that is smaller.
    pub threads: usize,
}

impl Default for ParallelizerOptions {
    fn default() -> Self {
        Self {
            prediction_area: Rect::default(),
            threads: 0,
        }
    }
}

/// Meta engine running one clone of a [`TileParallel`] engine per stripe.
pub struct Parallelizer<A: TileParallel> {
    imgs: Option<Arc<MultiResImages>>,
    opt: ParallelizerOptions,
    sample: A,
    output: Image,
}

impl<A: TileParallel> Parallelizer<A> {
    /// Creates a parallelizer around a fully configured engine sample.
    ///
    /// The sample must already have processed its algorithm options; its
    /// prediction area is overridden per stripe.
    pub fn new(sample: A) -> Self {
        Self {
            imgs: None,
            opt: ParallelizerOptions::default(),
            sample,
            output: Image::empty(),
        }
    }

    /// Copies and validates the parallelizer options.
    pub fn process_options(&mut self, o: &ParallelizerOptions) -> Result<()> {
        let pa = o.prediction_area;
        if !pa.is_all_zero() && (pa.width <= 0 || pa.height <= 0) {
            return Err(Error::size(
                format!("prediction area {pa} is empty or negative"),
                Some(pa.size()),
            ));
        }
        self.opt = o.clone();
        Ok(())
    }

    /// The previously set options.
    pub fn options(&self) -> &ParallelizerOptions {
        &self.opt
    }

    /// Splits `area` into `n` horizontal stripes with half-even rounded
    /// integer boundaries. Stripe heights sum to the total height.
    pub fn stripes(area: Rect, n: usize) -> Vec<Rect> {
        let step = area.height as f64 / n as f64;
        let mut out = Vec::with_capacity(n);
        let mut cur = area.y as f64;
        let mut top = area.y;
        for _ in 0..n {
            cur += step;
            let bottom = round_ties_even(cur) as i32;
            out.push(Rect::new(area.x, top, area.width, bottom - top));
            top = bottom;
        }
        out
    }
}

impl<A: TileParallel> DataFusor for Parallelizer<A> {
    fn set_src_images(&mut self, imgs: Arc<MultiResImages>) {
        self.imgs = Some(imgs);
    }

    fn output(&self) -> &Image {
        &self.output
    }

    fn take_output(&mut self) -> Image {
        std::mem::take(&mut self.output)
    }

    fn predict(&mut self, date: i32, mask: Option<&Image>) -> Result<()> {
        let imgs = self
            .imgs
            .clone()
            .ok_or_else(|| Error::not_found("parallelizer has no source image store"))?;

        let any = imgs.get_any()?;
        let full = any.size();
        let (kind, channels) = (any.kind(), any.channels());
        let pa = preamble::resolve_prediction_area(self.opt.prediction_area, full)?;

        preamble::ensure_output(&mut self.output, pa.size(), kind, channels)?;

        let hw = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let requested = if self.opt.threads == 0 {
            hw
        } else {
            self.opt.threads
        };
        let n = requested.min(pa.height as usize).max(1);

        let stripes = Self::stripes(pa, n);
        let mut workers: Vec<A> = Vec::with_capacity(n);
        for stripe in &stripes {
            let mut w = self.sample.clone();
            w.set_prediction_area(*stripe);
            w.set_src_images(Arc::clone(&imgs));
            workers.push(w);
        }

        let results: Vec<Result<()>> = workers
            .par_iter_mut()
            .map(|w| w.predict(date, mask))
            .collect();

        // exactly one captured error is re-raised, preferring later stripes
        let mut failure = None;
        for r in results {
            if let Err(e) = r {
                failure = Some(e);
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        for (worker, stripe) in workers.iter().zip(&stripes) {
            self.output
                .blit(worker.output(), Point::new(0, stripe.y - pa.y))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::starfm::StarfmFusor;

    #[test]
    fn stripes_partition_exactly() {
        for (height, n) in [(10, 3), (7, 7), (100, 8), (5, 2), (13, 4)] {
            let area = Rect::new(3, 11, 20, height);
            let stripes = Parallelizer::<StarfmFusor>::stripes(area, n);
            assert_eq!(stripes.len(), n);
            assert_eq!(stripes[0].y, area.y);
            let mut total = 0;
            for (i, s) in stripes.iter().enumerate() {
                assert_eq!(s.x, area.x);
                assert_eq!(s.width, area.width);
                assert!(s.height >= 0);
                if i > 0 {
                    assert_eq!(s.y, stripes[i - 1].bottom());
                }
                total += s.height;
            }
            assert_eq!(total, height);
        }
    }

    #[test]
    fn stripes_are_deterministic() {
        let area = Rect::new(0, 0, 10, 17);
        let a = Parallelizer::<StarfmFusor>::stripes(area, 5);
        let b = Parallelizer::<StarfmFusor>::stripes(area, 5);
        assert_eq!(a, b);
    }
}
