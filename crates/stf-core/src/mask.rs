//! Mask construction and reduction.
//!
//! A mask is an unsigned-8-bit image with 1 or N channels where 0 marks an
//! invalid pixel and 255 a valid one. Masks are derived from value ranges
//! of a data image: a pixel is valid when its value falls into one of the
//! given [`Interval`]s (or outside all of them, for an invalid-range set).
//!
//! ```rust
//! use stf_core::{mask, Image, Interval, PixelKind};
//!
//! let mut img = Image::new(3, 1, PixelKind::I16, 1).unwrap();
//! img.set_pixel::<i16>(0, 0, 0, -32768); // fill value
//! img.set_pixel::<i16>(1, 0, 0, 250);
//! img.set_pixel::<i16>(2, 0, 0, 9999);
//!
//! let m = mask::single_channel_mask(&img, &[Interval::closed(0.0, 5000.0)], true);
//! assert!(!m.bool_at(0, 0, 0));
//! assert!(m.bool_at(1, 0, 0));
//! assert!(!m.bool_at(2, 0, 0));
//! ```

use crate::error::{Error, Result};
use crate::image::Image;
use crate::kind::PixelKind;

/// Mask value for an invalid pixel.
pub const INVALID: u8 = 0;
/// Mask value for a valid pixel.
pub const VALID: u8 = 255;

/// A one-dimensional value interval with closed or open endpoints.
///
/// Infinite endpoints are expressed with `f64::NEG_INFINITY` /
/// `f64::INFINITY`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interval {
    /// Lower endpoint.
    pub low: f64,
    /// Upper endpoint.
    pub high: f64,
    /// Whether the lower endpoint belongs to the interval.
    pub low_closed: bool,
    /// Whether the upper endpoint belongs to the interval.
    pub high_closed: bool,
}

impl Interval {
    /// The closed interval [low, high].
    #[inline]
    pub const fn closed(low: f64, high: f64) -> Self {
        Self {
            low,
            high,
            low_closed: true,
            high_closed: true,
        }
    }

    /// The open interval (low, high).
    #[inline]
    pub const fn open(low: f64, high: f64) -> Self {
        Self {
            low,
            high,
            low_closed: false,
            high_closed: false,
        }
    }

    /// Returns `true` if `v` lies inside the interval.
    #[inline]
    pub fn contains(&self, v: f64) -> bool {
        let lo = if self.low_closed {
            v >= self.low
        } else {
            v > self.low
        };
        let hi = if self.high_closed {
            v <= self.high
        } else {
            v < self.high
        };
        lo && hi
    }
}

#[inline]
fn in_any(ranges: &[Interval], v: f64) -> bool {
    ranges.iter().any(|r| r.contains(v))
}

/// Builds a single-channel 0/255 mask from value ranges.
///
/// With `ranges_are_valid`, a channel value is good when it lies in one of
/// the ranges; otherwise when it lies in none of them. A pixel is valid only
/// if every channel is good (per-pixel AND across channels).
pub fn single_channel_mask(img: &Image, ranges: &[Interval], ranges_are_valid: bool) -> Image {
    let (w, h, ch) = (img.width(), img.height(), img.channels());
    let mut data = vec![INVALID; w as usize * h as usize];
    for y in 0..h {
        for x in 0..w {
            let good = (0..ch).all(|c| in_any(ranges, img.value(x, y, c)) == ranges_are_valid);
            if good {
                data[(y * w + x) as usize] = VALID;
            }
        }
    }
    Image::from_vec(w, h, 1, data).unwrap_or_else(|_| unreachable!("geometry from source image"))
}

/// Builds a multi-channel 0/255 mask from value ranges, one mask channel per
/// image channel.
pub fn multi_channel_mask(img: &Image, ranges: &[Interval], ranges_are_valid: bool) -> Image {
    let (w, h, ch) = (img.width(), img.height(), img.channels());
    let mut data = vec![INVALID; w as usize * h as usize * ch as usize];
    for y in 0..h {
        for x in 0..w {
            for c in 0..ch {
                if in_any(ranges, img.value(x, y, c)) == ranges_are_valid {
                    data[((y * w + x) as usize) * ch as usize + c as usize] = VALID;
                }
            }
        }
    }
    Image::from_vec(w, h, ch, data).unwrap_or_else(|_| unreachable!("geometry from source image"))
}

/// Reduces a multi-channel mask to a single channel by per-pixel AND: a
/// pixel is valid only if it is valid in every channel.
///
/// A single-channel mask is returned as a cheap shared copy.
///
/// # Errors
///
/// [`Error::ImageKind`] if the mask is not of unsigned-8-bit base kind.
pub fn reduce_and(mask: &Image) -> Result<Image> {
    crate::kind::ensure_kind_in(mask.kind(), &[PixelKind::U8], "mask reduction")?;
    if mask.channels() == 1 {
        return Ok(mask.shared_copy());
    }
    let (w, h, ch) = (mask.width(), mask.height(), mask.channels());
    let mut data = vec![INVALID; w as usize * h as usize];
    for y in 0..h {
        for x in 0..w {
            if (0..ch).all(|c| mask.bool_at(x, y, c)) {
                data[(y * w + x) as usize] = VALID;
            }
        }
    }
    Image::from_vec(w, h, 1, data).map_err(|_| Error::runtime("mask reduction allocation failed"))
}

/// Inverts a 0/255 mask in place.
pub fn invert(mask: &mut Image) {
    let (w, h, ch) = (mask.width(), mask.height(), mask.channels());
    for y in 0..h {
        for x in 0..w {
            for c in 0..ch {
                let v = if mask.bool_at(x, y, c) { INVALID } else { VALID };
                mask.set_pixel::<u8>(x, y, c, v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_endpoints() {
        let c = Interval::closed(0.0, 10.0);
        assert!(c.contains(0.0) && c.contains(10.0));
        let o = Interval::open(0.0, 10.0);
        assert!(!o.contains(0.0) && !o.contains(10.0) && o.contains(5.0));
        let half = Interval {
            low: 0.0,
            high: f64::INFINITY,
            low_closed: true,
            high_closed: true,
        };
        assert!(half.contains(1e12));
        assert!(!half.contains(-0.1));
    }

    #[test]
    fn single_channel_mask_ands_channels() {
        let mut img = Image::new(2, 1, PixelKind::U8, 2).unwrap();
        img.set_pixel::<u8>(0, 0, 0, 10);
        img.set_pixel::<u8>(0, 0, 1, 10);
        img.set_pixel::<u8>(1, 0, 0, 10);
        img.set_pixel::<u8>(1, 0, 1, 200); // second channel out of range

        let m = single_channel_mask(&img, &[Interval::closed(0.0, 100.0)], true);
        assert_eq!(m.channels(), 1);
        assert!(m.bool_at(0, 0, 0));
        assert!(!m.bool_at(1, 0, 0));
    }

    #[test]
    fn invalid_ranges_flip_polarity() {
        let mut img = Image::new(2, 1, PixelKind::I16, 1).unwrap();
        img.set_pixel::<i16>(0, 0, 0, -9999); // fill value
        img.set_pixel::<i16>(1, 0, 0, 55);

        let m = single_channel_mask(&img, &[Interval::closed(-9999.0, -9999.0)], false);
        assert!(!m.bool_at(0, 0, 0));
        assert!(m.bool_at(1, 0, 0));
    }

    #[test]
    fn reduce_and_requires_u8() {
        let img = Image::new(2, 2, PixelKind::F32, 2).unwrap();
        assert!(reduce_and(&img).is_err());
    }

    #[test]
    fn reduce_and_multi_channel() {
        let mut m = Image::filled(2, 1, PixelKind::U8, 3, 255.0).unwrap();
        m.set_pixel::<u8>(1, 0, 2, 0);
        let r = reduce_and(&m).unwrap();
        assert_eq!(r.channels(), 1);
        assert!(r.bool_at(0, 0, 0));
        assert!(!r.bool_at(1, 0, 0));
    }

    #[test]
    fn invert_roundtrip() {
        let mut m = Image::filled(2, 1, PixelKind::U8, 1, 255.0).unwrap();
        m.set_pixel::<u8>(1, 0, 0, 0);
        invert(&mut m);
        assert!(!m.bool_at(0, 0, 0));
        assert!(m.bool_at(1, 0, 0));
    }
}
