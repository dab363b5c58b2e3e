//! Shared prediction preamble: input consistency checks, prediction-area
//! resolution and output buffer management.
//!
//! Every engine runs these before dispatching a kernel, so all failure
//! modes surface from `predict` before any pixel is written.

use stf_core::{mask, Error, Image, MultiResImages, PixelKind, Rect, Result, Size};

/// Checks that every (tag, date) in `required` is present and that all of
/// them agree in size, base kind and channel count.
///
/// Returns the common (size, kind, channels).
pub fn check_images_consistent(
    imgs: &MultiResImages,
    required: &[(&str, i32)],
) -> Result<(Size, PixelKind, u32)> {
    let mut missing = Vec::new();
    for &(tag, date) in required {
        if !imgs.has(tag, date) {
            missing.push(format!("('{tag}', {date})"));
        }
    }
    if !missing.is_empty() {
        return Err(Error::not_found(format!(
            "required images are missing from the store: {}",
            missing.join(", ")
        )));
    }

    let first = imgs.get(required[0].0, required[0].1)?;
    let (size, kind, channels) = (first.size(), first.kind(), first.channels());
    for &(tag, date) in &required[1..] {
        let img = imgs.get(tag, date)?;
        if img.size() != size {
            return Err(Error::size(
                format!(
                    "image ('{tag}', {date}) has size {} while ('{}', {}) has {}",
                    img.size(),
                    required[0].0,
                    required[0].1,
                    size
                ),
                Some(img.size()),
            ));
        }
        if img.kind() != kind {
            return Err(Error::image_kind(
                format!(
                    "image ('{tag}', {date}) has base kind {} while ('{}', {}) has {}",
                    img.kind(),
                    required[0].0,
                    required[0].1,
                    kind
                ),
                Some(img.kind()),
            ));
        }
        if img.channels() != channels {
            return Err(Error::image_kind(
                format!(
                    "image ('{tag}', {date}) has {} channels while ('{}', {}) has {}",
                    img.channels(),
                    required[0].0,
                    required[0].1,
                    channels
                ),
                Some(img.kind()),
            ));
        }
    }
    Ok((size, kind, channels))
}

/// Validates a mask against the image geometry: equal size, unsigned 8 bit,
/// 1 or `channels` channels.
pub fn check_mask(mask: Option<&Image>, size: Size, channels: u32) -> Result<()> {
    let Some(m) = mask else { return Ok(()) };
    if m.size() != size {
        return Err(Error::size(
            format!(
                "mask size {} differs from image size {size}",
                m.size()
            ),
            Some(m.size()),
        ));
    }
    if m.kind() != PixelKind::U8 {
        return Err(Error::image_kind(
            format!(
                "mask must have base kind u8 to hold 0/255 values, got {}",
                m.kind()
            ),
            Some(m.kind()),
        ));
    }
    if m.channels() != 1 && m.channels() != channels {
        return Err(Error::image_kind(
            format!(
                "mask has {} channels, expected 1 or {channels}",
                m.channels()
            ),
            Some(m.kind()),
        ));
    }
    Ok(())
}

/// Reduces an optional validated mask to a single channel (per-pixel AND).
pub fn single_channel_mask(mask: Option<&Image>) -> Result<Option<Image>> {
    match mask {
        None => Ok(None),
        Some(m) => Ok(Some(mask::reduce_and(m)?)),
    }
}

/// Resolves the prediction area: the all-zero sentinel becomes the full
/// image; anything else must be non-empty and inside the image.
pub fn resolve_prediction_area(area: Rect, full: Size) -> Result<Rect> {
    if area.is_all_zero() {
        return Ok(Rect::from_size(full));
    }
    if area.width <= 0 || area.height <= 0 {
        return Err(Error::size(
            format!("prediction area {area} is empty or negative"),
            Some(area.size()),
        ));
    }
    if !Rect::from_size(full).contains_rect(&area) {
        return Err(Error::size(
            format!("prediction area {area} exceeds image bounds {full}"),
            Some(area.size()),
        ));
    }
    Ok(area)
}

/// Reuses the output buffer if size and type match the prediction, else
/// allocates a fresh one. Existing pixel values are left untouched either
/// way; the kernel overwrites them.
pub fn ensure_output(
    output: &mut Image,
    size: Size,
    kind: PixelKind,
    channels: u32,
) -> Result<()> {
    if output.size() != size || output.kind() != kind || output.channels() != channels {
        *output = Image::new(size.width, size.height, kind, channels)?;
    }
    Ok(())
}

/// Validates a moving-window size: odd and at least 3.
pub fn check_window_size(window_size: i32) -> Result<()> {
    if window_size < 3 || window_size % 2 == 0 {
        return Err(Error::invalid_argument(format!(
            "window size must be odd and >= 3, got {window_size}"
        )));
    }
    Ok(())
}

/// Validates the tag pair: both set and distinct.
pub fn check_tags(high_tag: &str, low_tag: &str) -> Result<()> {
    if high_tag.is_empty() || low_tag.is_empty() {
        return Err(Error::invalid_argument(
            "both resolution tags must be set before prediction",
        ));
    }
    if high_tag == low_tag {
        return Err(Error::invalid_argument(format!(
            "the resolution tags must differ, got '{high_tag}' for both"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stf_core::{Image, MultiResImages, PixelKind};

    fn store() -> MultiResImages {
        let mut s = MultiResImages::new();
        s.set("high", 1, Image::new(4, 4, PixelKind::U16, 2).unwrap());
        s.set("low", 1, Image::new(4, 4, PixelKind::U16, 2).unwrap());
        s.set("low", 2, Image::new(4, 4, PixelKind::U16, 2).unwrap());
        s
    }

    #[test]
    fn consistent_inputs_pass() {
        let s = store();
        let (size, kind, ch) =
            check_images_consistent(&s, &[("high", 1), ("low", 1), ("low", 2)]).unwrap();
        assert_eq!(size, Size::new(4, 4));
        assert_eq!(kind, PixelKind::U16);
        assert_eq!(ch, 2);
    }

    #[test]
    fn missing_image_is_not_found() {
        let s = store();
        let err = check_images_consistent(&s, &[("high", 1), ("low", 9)]).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn size_and_kind_mismatches() {
        let mut s = store();
        s.set("low", 3, Image::new(5, 4, PixelKind::U16, 2).unwrap());
        assert!(check_images_consistent(&s, &[("high", 1), ("low", 3)])
            .unwrap_err()
            .is_size_error());

        s.set("low", 4, Image::new(4, 4, PixelKind::I16, 2).unwrap());
        assert!(check_images_consistent(&s, &[("high", 1), ("low", 4)])
            .unwrap_err()
            .is_kind_error());

        s.set("low", 5, Image::new(4, 4, PixelKind::U16, 1).unwrap());
        assert!(check_images_consistent(&s, &[("high", 1), ("low", 5)])
            .unwrap_err()
            .is_kind_error());
    }

    #[test]
    fn mask_rules() {
        let size = Size::new(4, 4);
        assert!(check_mask(None, size, 2).is_ok());

        let good = Image::new(4, 4, PixelKind::U8, 1).unwrap();
        assert!(check_mask(Some(&good), size, 2).is_ok());

        let multi = Image::new(4, 4, PixelKind::U8, 2).unwrap();
        assert!(check_mask(Some(&multi), size, 2).is_ok());

        let wrong_ch = Image::new(4, 4, PixelKind::U8, 3).unwrap();
        assert!(check_mask(Some(&wrong_ch), size, 2).is_err());

        let wrong_kind = Image::new(4, 4, PixelKind::U16, 1).unwrap();
        assert!(check_mask(Some(&wrong_kind), size, 2).is_err());

        let wrong_size = Image::new(3, 4, PixelKind::U8, 1).unwrap();
        assert!(check_mask(Some(&wrong_size), size, 2).is_err());
    }

    #[test]
    fn prediction_area_resolution() {
        let full = Size::new(10, 10);
        assert_eq!(
            resolve_prediction_area(Rect::default(), full).unwrap(),
            Rect::new(0, 0, 10, 10)
        );
        assert_eq!(
            resolve_prediction_area(Rect::new(2, 3, 4, 5), full).unwrap(),
            Rect::new(2, 3, 4, 5)
        );
        assert!(resolve_prediction_area(Rect::new(0, 0, -1, 5), full).is_err());
        assert!(resolve_prediction_area(Rect::new(8, 8, 4, 4), full).is_err());
    }

    #[test]
    fn output_reuse() {
        let mut out = Image::filled(4, 4, PixelKind::U16, 2, 7.0).unwrap();
        ensure_output(&mut out, Size::new(4, 4), PixelKind::U16, 2).unwrap();
        // untouched on match
        assert_eq!(out.pixel::<u16>(0, 0, 0), 7);

        ensure_output(&mut out, Size::new(3, 3), PixelKind::U16, 2).unwrap();
        assert_eq!(out.size(), Size::new(3, 3));
        assert_eq!(out.pixel::<u16>(0, 0, 0), 0);
    }

    #[test]
    fn window_and_tag_validation() {
        assert!(check_window_size(3).is_ok());
        assert!(check_window_size(51).is_ok());
        assert!(check_window_size(1).is_err());
        assert!(check_window_size(4).is_err());
        assert!(check_tags("high", "low").is_ok());
        assert!(check_tags("same", "same").is_err());
        assert!(check_tags("", "low").is_err());
    }
}
