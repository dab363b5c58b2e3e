//! # stf-interp
//!
//! Temporal linear gap filling for cloud-masked image time series.
//!
//! Given a per-date image stack for one resolution tag, a per-date cloud
//! mask and an optional per-date validity mask, every pixel marked cloudy
//! at the target date is linearly interpolated between the nearest
//! non-cloudy, valid dates on either side. If only one side has a valid
//! neighbor its value is copied; if neither has one, the value is left
//! alone and the state image marks the pixel as non-interpolated.
//!
//! ```no_run
//! use stf_core::MultiResImages;
//! use stf_interp::{InterpolateOptions, Interpolator};
//!
//! let imgs = MultiResImages::new();       // per-date images
//! let clouds = MultiResImages::new();     // per-date 0/255 cloud masks
//! let interp = Interpolator {
//!     images: &imgs,
//!     cloud_masks: &clouds,
//!     valid_masks: None,
//!     tag: "low",
//!     options: InterpolateOptions::default(),
//! };
//! let filled = interp.interpolate(42).unwrap();
//! println!("interpolated {} of {} cloudy pixels",
//!     filled.stats.interpolated_before - filled.stats.interpolated_after,
//!     filled.stats.interpolated_before);
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use rayon::prelude::*;
use stf_core::{dispatch_kind, Error, Image, MultiResImages, PixelKind, Result, Storable};

/// Per-pixel outcome of a gap-fill run, stored in the state image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PixelState {
    /// Invalid input data, left alone.
    Nodata = 0,
    /// Cloudy with no usable neighbor on either side, left alone.
    NonInterpolated = 64,
    /// Not cloudy; the original value was kept.
    Clear = 128,
    /// Cloudy and filled from the neighboring dates.
    Interpolated = 192,
}

/// Options of the gap filler.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterpolateOptions {
    /// A pixel that is both nodata-invalid and cloud-marked is treated as a
    /// cloud (and interpolated) instead of as nodata (and left alone).
    pub prefer_clouds_over_nodata: bool,
}

/// Summary counts of one gap-fill run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterpStats {
    /// Channel values marked nodata.
    pub nodata: u64,
    /// Channel values that were cloudy before filling.
    pub interpolated_before: u64,
    /// Channel values still unfilled afterwards.
    pub interpolated_after: u64,
}

/// Result of one gap-fill run.
pub struct Interpolated {
    /// The filled image.
    pub image: Image,
    /// Pixel states, one channel per image channel.
    pub state: Image,
    /// Summary counts.
    pub stats: InterpStats,
}

/// Linear gap filler over an image time series.
///
/// Cloud masks are single-channel 0/255 images (non-zero = cloudy);
/// validity masks may be single- or multi-channel (0 = invalid).
pub struct Interpolator<'a> {
    /// Per-date images of one resolution.
    pub images: &'a MultiResImages,
    /// Per-date cloud masks, stored under the same tag and dates.
    pub cloud_masks: &'a MultiResImages,
    /// Optional per-date validity masks, stored under the same tag.
    pub valid_masks: Option<&'a MultiResImages>,
    /// The resolution tag to process.
    pub tag: &'a str,
    /// Behavior switches.
    pub options: InterpolateOptions,
}

impl Interpolator<'_> {
    /// Fills the cloudy pixels of the image at `date`.
    pub fn interpolate(&self, date: i32) -> Result<Interpolated> {
        let target = self.images.get(self.tag, date)?;
        let clouds = self.cloud_masks.get(self.tag, date)?;
        if clouds.size() != target.size() {
            return Err(Error::size(
                format!(
                    "cloud mask size {} differs from image size {}",
                    clouds.size(),
                    target.size()
                ),
                Some(clouds.size()),
            ));
        }
        if clouds.kind() != PixelKind::U8 {
            return Err(Error::image_kind(
                format!("cloud masks must have base kind u8, got {}", clouds.kind()),
                Some(clouds.kind()),
            ));
        }

        let dates = self.images.dates(self.tag);
        let pos = dates
            .iter()
            .position(|&d| d == date)
            .ok_or_else(|| Error::not_found(format!("date {date} not in the series")))?;
        // nearest-first date candidates on both sides
        let left: Vec<i32> = dates[..pos].iter().rev().copied().collect();
        let right: Vec<i32> = dates[pos + 1..].to_vec();

        let result =
            dispatch_kind!(target.kind(), T => self.run::<T>(date, target, clouds, &left, &right));
        if let Ok(r) = &result {
            tracing::debug!(
                date,
                nodata = r.stats.nodata,
                cloudy = r.stats.interpolated_before,
                unfilled = r.stats.interpolated_after,
                "gap fill finished"
            );
        }
        result
    }

    fn valid_at(&self, date: i32, x: i32, y: i32, c: u32) -> bool {
        let Some(masks) = self.valid_masks else {
            return true;
        };
        let Ok(mask) = masks.get(self.tag, date) else {
            return true; // no mask stored for this date
        };
        let mc = if mask.channels() > c { c } else { 0 };
        mask.bool_at(x, y, mc)
    }

    fn cloudy_at(&self, date: i32, x: i32, y: i32) -> bool {
        self.cloud_masks
            .get(self.tag, date)
            .map(|m| m.bool_at(x, y, 0))
            .unwrap_or(false)
    }

    fn run<T: Storable>(
        &self,
        date: i32,
        target: &Image,
        clouds: &Image,
        left: &[i32],
        right: &[i32],
    ) -> Result<Interpolated> {
        let (w, h, channels) = (target.width(), target.height(), target.channels());
        let mut image = target.clone_owned();
        let mut state = Image::new(w, h, PixelKind::U8, channels)?;

        // each row is independent; produce (values, states, counts) per row
        #[allow(clippy::type_complexity)]
        let rows: Vec<(Vec<Option<T>>, Vec<u8>, InterpStats)> = (0..h)
            .into_par_iter()
            .map(|y| {
                let mut values: Vec<Option<T>> = vec![None; w as usize * channels as usize];
                let mut states = vec![PixelState::Clear as u8; w as usize * channels as usize];
                let mut stats = InterpStats::default();
                for x in 0..w {
                    for c in 0..channels {
                        let i = (x * channels as i32 + c as i32) as usize;
                        let is_invalid = !self.valid_at(date, x, y, c);
                        let is_cloud = clouds.bool_at(x, y, 0);
                        if is_invalid && (!is_cloud || !self.options.prefer_clouds_over_nodata) {
                            states[i] = PixelState::Nodata as u8;
                            stats.nodata += 1;
                            continue;
                        }
                        if !is_cloud {
                            states[i] = PixelState::Clear as u8;
                            continue;
                        }
                        stats.interpolated_before += 1;
                        states[i] = PixelState::Interpolated as u8;

                        let find = |candidates: &[i32]| -> Option<i32> {
                            candidates
                                .iter()
                                .copied()
                                .find(|&d| self.valid_at(d, x, y, c) && !self.cloudy_at(d, x, y))
                        };
                        let date_left = find(left);
                        let date_right = find(right);

                        match (date_left, date_right) {
                            (None, None) => {
                                // nothing usable: keep the value, mark it
                                states[i] = PixelState::NonInterpolated as u8;
                                stats.interpolated_after += 1;
                            }
                            (Some(d), None) | (None, Some(d)) => {
                                let img = self.images.get(self.tag, d)?;
                                values[i] = Some(img.pixel::<T>(x, y, c));
                            }
                            (Some(dl), Some(dr)) => {
                                let vl = self.images.get(self.tag, dl)?.pixel::<T>(x, y, c).to_f64();
                                let vr = self.images.get(self.tag, dr)?.pixel::<T>(x, y, c).to_f64();
                                let t = f64::from(date - dl) / f64::from(dr - dl);
                                values[i] = Some(T::from_f64(vl + t * (vr - vl)));
                            }
                        }
                    }
                }
                Ok((values, states, stats))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut stats = InterpStats::default();
        for (y, (values, states, row_stats)) in rows.into_iter().enumerate() {
            stats.nodata += row_stats.nodata;
            stats.interpolated_before += row_stats.interpolated_before;
            stats.interpolated_after += row_stats.interpolated_after;
            for x in 0..w {
                for c in 0..channels {
                    let i = (x * channels as i32 + c as i32) as usize;
                    if let Some(v) = values[i] {
                        image.set_pixel::<T>(x, y as i32, c, v);
                    }
                    state.set_pixel::<u8>(x, y as i32, c, states[i]);
                }
            }
        }
        Ok(Interpolated { image, state, stats })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series() -> (MultiResImages, MultiResImages) {
        let mut imgs = MultiResImages::new();
        let mut clouds = MultiResImages::new();
        for (date, value) in [(0, 100.0), (10, 0.0), (20, 300.0)] {
            imgs.set(
                "low",
                date,
                Image::filled(3, 3, PixelKind::U16, 1, value).unwrap(),
            );
            clouds.set(
                "low",
                date,
                Image::new(3, 3, PixelKind::U8, 1).unwrap(), // cloud free
            );
        }
        (imgs, clouds)
    }

    #[test]
    fn interpolates_between_both_sides() {
        let (imgs, mut clouds) = series();
        // the middle date is fully cloudy
        clouds.set("low", 10, Image::filled(3, 3, PixelKind::U8, 1, 255.0).unwrap());

        let interp = Interpolator {
            images: &imgs,
            cloud_masks: &clouds,
            valid_masks: None,
            tag: "low",
            options: InterpolateOptions::default(),
        };
        let out = interp.interpolate(10).unwrap();
        // halfway between 100 and 300
        assert_eq!(out.image.pixel::<u16>(1, 1, 0), 200);
        assert_eq!(out.state.pixel::<u8>(1, 1, 0), PixelState::Interpolated as u8);
        assert_eq!(out.stats.interpolated_before, 9);
        assert_eq!(out.stats.interpolated_after, 0);
    }

    #[test]
    fn copies_single_sided_neighbor() {
        let (imgs, mut clouds) = series();
        // both the middle and the right date are cloudy
        clouds.set("low", 10, Image::filled(3, 3, PixelKind::U8, 1, 255.0).unwrap());
        clouds.set("low", 20, Image::filled(3, 3, PixelKind::U8, 1, 255.0).unwrap());

        let interp = Interpolator {
            images: &imgs,
            cloud_masks: &clouds,
            valid_masks: None,
            tag: "low",
            options: InterpolateOptions::default(),
        };
        let out = interp.interpolate(10).unwrap();
        assert_eq!(out.image.pixel::<u16>(0, 0, 0), 100); // copied from the left
    }

    #[test]
    fn marks_unfillable_pixels() {
        let mut imgs = MultiResImages::new();
        let mut clouds = MultiResImages::new();
        imgs.set("low", 5, Image::filled(2, 2, PixelKind::U16, 1, 77.0).unwrap());
        clouds.set("low", 5, Image::filled(2, 2, PixelKind::U8, 1, 255.0).unwrap());

        let interp = Interpolator {
            images: &imgs,
            cloud_masks: &clouds,
            valid_masks: None,
            tag: "low",
            options: InterpolateOptions::default(),
        };
        let out = interp.interpolate(5).unwrap();
        assert_eq!(out.image.pixel::<u16>(0, 0, 0), 77); // untouched
        assert_eq!(
            out.state.pixel::<u8>(0, 0, 0),
            PixelState::NonInterpolated as u8
        );
        assert_eq!(out.stats.interpolated_after, 4);
    }

    #[test]
    fn nodata_beats_clouds_unless_configured() {
        let (imgs, mut clouds) = series();
        clouds.set("low", 10, Image::filled(3, 3, PixelKind::U8, 1, 255.0).unwrap());
        let mut valid = MultiResImages::new();
        valid.set("low", 10, Image::new(3, 3, PixelKind::U8, 1).unwrap()); // all invalid

        let mut interp = Interpolator {
            images: &imgs,
            cloud_masks: &clouds,
            valid_masks: Some(&valid),
            tag: "low",
            options: InterpolateOptions::default(),
        };
        let out = interp.interpolate(10).unwrap();
        assert_eq!(out.state.pixel::<u8>(0, 0, 0), PixelState::Nodata as u8);
        assert_eq!(out.image.pixel::<u16>(0, 0, 0), 0); // left alone

        interp.options.prefer_clouds_over_nodata = true;
        let out = interp.interpolate(10).unwrap();
        assert_eq!(
            out.state.pixel::<u8>(0, 0, 0),
            PixelState::Interpolated as u8
        );
        assert_eq!(out.image.pixel::<u16>(0, 0, 0), 200);
    }

    #[test]
    fn interpolation_respects_date_spacing() {
        let mut imgs = MultiResImages::new();
        let mut clouds = MultiResImages::new();
        for (date, value) in [(0, 0.0), (1, 50.0), (4, 400.0)] {
            imgs.set("low", date, Image::filled(1, 1, PixelKind::U16, 1, value).unwrap());
            clouds.set("low", date, Image::new(1, 1, PixelKind::U8, 1).unwrap());
        }
        clouds.set("low", 1, Image::filled(1, 1, PixelKind::U8, 1, 255.0).unwrap());

        let interp = Interpolator {
            images: &imgs,
            cloud_masks: &clouds,
            valid_masks: None,
            tag: "low",
            options: InterpolateOptions::default(),
        };
        let out = interp.interpolate(1).unwrap();
        // 0 + (1-0)/(4-0) * 400 = 100
        assert_eq!(out.image.pixel::<u16>(0, 0, 0), 100);
    }
}
