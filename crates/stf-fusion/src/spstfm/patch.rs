//! Patch geometry and extraction.
//!
//! SPSTFM works on square patches of side P that overlap by O pixels, laid
//! out on a grid anchored at the sample-area origin. Patch columns are the
//! row-major linearization of the patch, so a patch vector has P² entries.
//!
//! Patches may reach outside the image; out-of-bounds coordinates mirror
//! across the boundary once. Reaching further than one image extent is a
//! size error.

use nalgebra::DVector;
use stf_core::{Error, Image, Point, Rect, Result};

/// Number of patches along one axis for a sample-area extent.
#[inline]
pub fn patches_per_axis(extent: i32, patch_size: u32, overlap: u32) -> usize {
    let dist = (patch_size - overlap) as i32;
    ((extent - overlap as i32) / dist).max(0) as usize
}

/// The rectangle of full patches covering `pred_area`.
///
/// The returned area contains the prediction area completely and expands it
/// symmetrically so a whole number of patches tiles it; the result may
/// leave the image bounds. When the patch size is even and the overlap is
/// half the patch size, the cover can come out one patch larger than
/// strictly necessary on a one-sided boundary; this is accepted.
pub fn calc_required_area(pred_area: Rect, patch_size: u32, overlap: u32) -> Rect {
    debug_assert!(overlap <= patch_size / 2, "multi-patch overlap not supported");
    let dist = (patch_size - overlap) as i32;
    let npx = (pred_area.width + overlap as i32 - 1) / dist + 1;
    let npy = (pred_area.height + overlap as i32 - 1) / dist + 1;

    let width = npx * dist + overlap as i32;
    let height = npy * dist + overlap as i32;
    Rect::new(
        pred_area.x - (width - pred_area.width) / 2,
        pred_area.y - (height - pred_area.height) / 2,
        width,
        height,
    )
}

/// Top-left corner of patch (pxi, pyi) in image coordinates.
#[inline]
pub fn patch_origin(pxi: i32, pyi: i32, patch_size: u32, overlap: u32, sample_area: Rect) -> Point {
    let dist = (patch_size - overlap) as i32;
    Point::new(pxi * dist + sample_area.x, pyi * dist + sample_area.y)
}

/// Extracts patch (pxi, pyi) of `channel` as a row-major patch vector.
///
/// Out-of-bounds coordinates mirror across the image boundary once.
///
/// # Errors
///
/// [`Error::Size`] when the patch lies further outside than one mirrored
/// image extent.
pub fn extract_patch(
    img: &Image,
    pxi: i32,
    pyi: i32,
    patch_size: u32,
    overlap: u32,
    sample_area: Rect,
    channel: u32,
) -> Result<DVector<f64>> {
    let p0 = patch_origin(pxi, pyi, patch_size, overlap, sample_area);
    let p = patch_size as i32;
    let (w, h) = (img.width(), img.height());
    if p0.x < -w || p0.x + p - 1 >= 2 * w || p0.y < -h || p0.y + p - 1 >= 2 * h {
        return Err(Error::size(
            format!(
                "patch from ({}, {}) to ({}, {}) out of the mirrored bounds of a {} image",
                p0.x,
                p0.y,
                p0.x + p - 1,
                p0.y + p - 1,
                img.size()
            ),
            Some(img.size()),
        ));
    }

    let mut out = DVector::zeros((patch_size * patch_size) as usize);
    let mut i = 0;
    for y in p0.y..p0.y + p {
        for x in p0.x..p0.x + p {
            let mut xs = x;
            let mut ys = y;
            if xs < 0 {
                xs = -xs - 1;
            }
            if ys < 0 {
                ys = -ys - 1;
            }
            if xs >= w {
                xs = 2 * w - 1 - xs;
            }
            if ys >= h {
                ys = 2 * h - 1 - ys;
            }
            out[i] = img.value(xs, ys, channel);
            i += 1;
        }
    }
    Ok(out)
}

/// Extracts the difference patch `patch(a) − patch(b)`.
pub fn extract_diff_patch(
    a: &Image,
    b: &Image,
    pxi: i32,
    pyi: i32,
    patch_size: u32,
    overlap: u32,
    sample_area: Rect,
    channel: u32,
) -> Result<DVector<f64>> {
    let pa = extract_patch(a, pxi, pyi, patch_size, overlap, sample_area, channel)?;
    let pb = extract_patch(b, pxi, pyi, patch_size, overlap, sample_area, channel)?;
    Ok(pa - pb)
}

/// Picks the mask channel to pair with a data channel: per-channel masks use
/// the matching channel, single-channel masks are shared.
#[inline]
pub fn mask_channel(mask: &Image, channel: u32) -> u32 {
    if mask.channels() > channel {
        channel
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stf_core::PixelKind;

    fn numbered(size: i32) -> Image {
        let mut img = Image::new(size, size, PixelKind::U8, 2).unwrap();
        for y in 0..size {
            for x in 0..size {
                img.set_pixel::<u8>(x, y, 0, (x + size * y) as u8);
                img.set_pixel::<u8>(x, y, 1, 255 - (x + size * y) as u8);
            }
        }
        img
    }

    fn reshape(v: &DVector<f64>, p: usize) -> Vec<Vec<f64>> {
        (0..p).map(|y| (0..p).map(|x| v[y * p + x]).collect()).collect()
    }

    #[test]
    fn grid_counts() {
        // 17 = 3 * (7 - 2) + 2
        assert_eq!(patches_per_axis(17, 7, 2), 3);
        assert_eq!(patches_per_axis(15, 5, 0), 3);
        assert_eq!(patches_per_axis(4, 5, 0), 0);
    }

    #[test]
    fn required_area_covers_prediction() {
        let pred = Rect::new(0, 0, 30, 30);
        let area = calc_required_area(pred, 7, 2);
        assert!(area.contains_rect(&pred));
        // the cover consists of whole patches
        let dist = 5;
        assert_eq!((area.width - 2) % dist, 0);
        assert_eq!((area.height - 2) % dist, 0);
    }

    #[test]
    fn mirrored_patch_flips() {
        let img = numbered(10);
        // a sample area starting one image width/height before the origin
        let area = Rect::new(-10, -10, 30, 30);
        let p = 5u32;

        // patch fully left-and-above of the image: flipped in both axes
        let outside = extract_patch(&img, 1, 1, p, 0, area, 1).unwrap();
        let inside = extract_patch(&img, 2, 2, p, 0, area, 1).unwrap();
        let o = reshape(&outside, 5);
        let i = reshape(&inside, 5);
        for y in 0..5 {
            for x in 0..5 {
                assert_eq!(o[y][x], i[4 - y][4 - x]);
            }
        }

        // patch right of the image: flipped horizontally
        let right = extract_patch(&img, 5, 2, p, 0, area, 0).unwrap();
        let r = reshape(&right, 5);
        let i = reshape(&extract_patch(&img, 2, 2, p, 0, area, 0).unwrap(), 5);
        for y in 0..5 {
            for x in 0..5 {
                assert_eq!(r[y][x], i[y][9 - x - 5]);
            }
        }
    }

    #[test]
    fn half_outside_patch_is_symmetric() {
        let img = numbered(10);
        let area = Rect::new(-10, -10, 30, 30);
        // patch from (-2, 2) to (1, 5): mirrored around the left edge
        let p = extract_patch(&img, 2, 3, 4, 0, area, 0).unwrap();
        let m = reshape(&p, 4);
        for y in 0..4 {
            for x in 0..2 {
                assert_eq!(m[y][1 - x], m[y][2 + x]);
                assert_eq!(m[y][2 + x], img.value(x as i32, y as i32 + 2, 0));
            }
        }
    }

    #[test]
    fn too_far_outside_is_a_size_error() {
        let img = numbered(10);
        let area = Rect::new(-10, -10, 30, 30);
        assert!(extract_patch(&img, -1, 0, 5, 0, area, 0).is_err());
        assert!(extract_patch(&img, 0, -1, 5, 0, area, 0).is_err());
        assert!(extract_patch(&img, 6, 0, 5, 0, area, 0).is_err());
        assert!(extract_patch(&img, 0, 6, 5, 0, area, 0).is_err());
        // the outermost fully mirrored positions are still fine
        assert!(extract_patch(&img, 0, 0, 5, 0, area, 0).is_ok());
        assert!(extract_patch(&img, 5, 5, 5, 0, area, 0).is_ok());
    }

    #[test]
    fn diff_patch_subtracts() {
        let a = numbered(10);
        let b = numbered(10);
        let area = Rect::new(0, 0, 10, 10);
        let d = extract_diff_patch(&a, &b, 0, 0, 5, 0, area, 0).unwrap();
        assert!(d.iter().all(|&v| v == 0.0));
    }
}
