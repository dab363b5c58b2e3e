//! The dynamic image container.
//!
//! [`Image`] is an owning, shareable, croppable 2-D pixel buffer. Unlike a
//! compile-time-typed buffer it carries its scalar kind as a runtime tag
//! ([`PixelKind`]) plus a channel count in [1, 25]; kernels fix the type via
//! [`dispatch_kind!`](crate::dispatch_kind) and then use the typed accessors
//! ([`pixel`](Image::pixel) / [`set_pixel`](Image::set_pixel)).
//!
//! # Sharing and cropping
//!
//! The pixel data lives behind an `Arc`, so `clone()` / [`shared_copy`]
//! (Image::shared_copy) is cheap and shares storage; [`is_shared_with`]
//! (Image::is_shared_with) tests storage identity. [`shared_crop`]
//! (Image::shared_crop) restricts the visible region without copying;
//! crops are relative and nest. [`clone_owned`](Image::clone_owned) makes a
//! compact deep copy of the visible region.
//!
//! Mutation is copy-on-write: writing through a view whose storage is still
//! shared first detaches the storage (`Arc::make_mut`). Engines own their
//! output buffers exclusively while predicting, so the detach never triggers
//! on the hot path.
//!
//! # Memory Layout
//!
//! Row-major, top-to-bottom, channels interleaved per pixel. A cropped view
//! keeps the parent's row stride, so rows of a crop are contiguous slices of
//! the parent row.
//!
//! ```rust
//! use stf_core::{Image, PixelKind, Rect};
//!
//! let mut img = Image::new(8, 8, PixelKind::U16, 2).unwrap();
//! img.set_pixel::<u16>(3, 4, 1, 999);
//!
//! let view = img.shared_crop(Rect::new(2, 2, 4, 4)).unwrap();
//! assert!(view.is_shared_with(&img));
//! assert_eq!(view.pixel::<u16>(1, 2, 1), 999);
//! ```

use crate::error::{Error, Result};
use crate::geom::{Rect, Size};
use crate::kind::{PixelKind, Scalar, MAX_CHANNELS};
use std::sync::Arc;

/// Backing storage: one vector per scalar kind, reference counted.
#[doc(hidden)]
#[derive(Clone)]
pub enum Buf {
    I8(Arc<Vec<i8>>),
    U8(Arc<Vec<u8>>),
    I16(Arc<Vec<i16>>),
    U16(Arc<Vec<u16>>),
    I32(Arc<Vec<i32>>),
    F32(Arc<Vec<f32>>),
    F64(Arc<Vec<f64>>),
}

macro_rules! with_buf {
    ($buf:expr, $v:ident => $body:expr) => {
        match $buf {
            Buf::I8($v) => $body,
            Buf::U8($v) => $body,
            Buf::I16($v) => $body,
            Buf::U16($v) => $body,
            Buf::I32($v) => $body,
            Buf::F32($v) => $body,
            Buf::F64($v) => $body,
        }
    };
}

impl Buf {
    fn kind(&self) -> PixelKind {
        match self {
            Buf::I8(_) => PixelKind::I8,
            Buf::U8(_) => PixelKind::U8,
            Buf::I16(_) => PixelKind::I16,
            Buf::U16(_) => PixelKind::U16,
            Buf::I32(_) => PixelKind::I32,
            Buf::F32(_) => PixelKind::F32,
            Buf::F64(_) => PixelKind::F64,
        }
    }

    fn ptr_eq(&self, other: &Buf) -> bool {
        match (self, other) {
            (Buf::I8(a), Buf::I8(b)) => Arc::ptr_eq(a, b),
            (Buf::U8(a), Buf::U8(b)) => Arc::ptr_eq(a, b),
            (Buf::I16(a), Buf::I16(b)) => Arc::ptr_eq(a, b),
            (Buf::U16(a), Buf::U16(b)) => Arc::ptr_eq(a, b),
            (Buf::I32(a), Buf::I32(b)) => Arc::ptr_eq(a, b),
            (Buf::F32(a), Buf::F32(b)) => Arc::ptr_eq(a, b),
            (Buf::F64(a), Buf::F64(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Scalar types that can live in an [`Image`] buffer.
///
/// This is the storage-side companion of [`Scalar`]; it is implemented for
/// exactly the seven base kinds and not meant to be implemented elsewhere.
pub trait Storable: Scalar {
    #[doc(hidden)]
    fn slice(buf: &Buf) -> Option<&[Self]>;
    #[doc(hidden)]
    fn slice_mut(buf: &mut Buf) -> Option<&mut Vec<Self>>;
    #[doc(hidden)]
    fn into_buf(data: Vec<Self>) -> Buf;
}

macro_rules! impl_storable {
    ($t:ty, $variant:ident) => {
        impl Storable for $t {
            fn slice(buf: &Buf) -> Option<&[Self]> {
                match buf {
                    Buf::$variant(v) => Some(v.as_slice()),
                    _ => None,
                }
            }

            fn slice_mut(buf: &mut Buf) -> Option<&mut Vec<Self>> {
                match buf {
                    Buf::$variant(v) => Some(Arc::make_mut(v)),
                    _ => None,
                }
            }

            fn into_buf(data: Vec<Self>) -> Buf {
                Buf::$variant(Arc::new(data))
            }
        }
    };
}

impl_storable!(i8, I8);
impl_storable!(u8, U8);
impl_storable!(i16, I16);
impl_storable!(u16, U16);
impl_storable!(i32, I32);
impl_storable!(f32, F32);
impl_storable!(f64, F64);

/// Owning, shareable, croppable 2-D pixel buffer with a runtime pixel kind.
///
/// See the [module documentation](self) for sharing and layout semantics.
#[derive(Clone)]
pub struct Image {
    buf: Buf,
    channels: u32,
    /// Size of the backing pixel grid.
    full: Size,
    /// Visible window, in backing-grid coordinates.
    region: Rect,
}

impl Default for Image {
    fn default() -> Self {
        Self::empty()
    }
}

impl Image {
    /// Creates an empty (zero-size) image, used as an output placeholder.
    pub fn empty() -> Self {
        Self {
            buf: Buf::U8(Arc::new(Vec::new())),
            channels: 1,
            full: Size::default(),
            region: Rect::default(),
        }
    }

    /// Creates a zero-filled image.
    ///
    /// # Errors
    ///
    /// [`Error::Size`] for negative dimensions, [`Error::ImageKind`] for a
    /// channel count outside [1, 25].
    pub fn new(width: i32, height: i32, kind: PixelKind, channels: u32) -> Result<Self> {
        Self::filled(width, height, kind, channels, 0.0)
    }

    /// Creates an image filled with `value` (saturating-cast per kind).
    pub fn filled(
        width: i32,
        height: i32,
        kind: PixelKind,
        channels: u32,
        value: f64,
    ) -> Result<Self> {
        check_geometry(width, height, channels)?;
        let len = width as usize * height as usize * channels as usize;
        let buf = crate::dispatch_kind!(kind, T => {
            <T as Storable>::into_buf(vec![<T as Scalar>::from_f64(value); len])
        });
        Ok(Self {
            buf,
            channels,
            full: Size::new(width, height),
            region: Rect::new(0, 0, width, height),
        })
    }

    /// Creates an image from existing pixel data (row-major, channels
    /// interleaved).
    ///
    /// # Errors
    ///
    /// [`Error::Size`] if the data length does not match
    /// `width * height * channels`.
    pub fn from_vec<T: Storable>(
        width: i32,
        height: i32,
        channels: u32,
        data: Vec<T>,
    ) -> Result<Self> {
        check_geometry(width, height, channels)?;
        let expected = width as usize * height as usize * channels as usize;
        if data.len() != expected {
            return Err(Error::size(
                format!("expected {} elements, got {}", expected, data.len()),
                Some(Size::new(width, height)),
            ));
        }
        Ok(Self {
            buf: T::into_buf(data),
            channels,
            full: Size::new(width, height),
            region: Rect::new(0, 0, width, height),
        })
    }

    /// The base pixel kind. Fixed for the lifetime of the image.
    #[inline]
    pub fn kind(&self) -> PixelKind {
        self.buf.kind()
    }

    /// Number of channels per pixel. Fixed for the lifetime of the image.
    #[inline]
    pub fn channels(&self) -> u32 {
        self.channels
    }

    /// Visible width in pixels.
    #[inline]
    pub fn width(&self) -> i32 {
        self.region.width
    }

    /// Visible height in pixels.
    #[inline]
    pub fn height(&self) -> i32 {
        self.region.height
    }

    /// Visible size.
    #[inline]
    pub fn size(&self) -> Size {
        self.region.size()
    }

    /// Returns `true` if the image has no pixels.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    /// A shared view of the same storage and region.
    #[inline]
    pub fn shared_copy(&self) -> Image {
        self.clone()
    }

    /// A shared view restricted to `rect`, relative to this view's origin.
    ///
    /// Crops nest: cropping a crop is relative to the inner view. The
    /// requested rectangle must lie fully inside the current view.
    pub fn shared_crop(&self, rect: Rect) -> Result<Image> {
        if rect.width < 0 || rect.height < 0 {
            return Err(Error::size(
                format!("crop rectangle has negative size: {rect}"),
                Some(rect.size()),
            ));
        }
        let own = Rect::from_size(self.size());
        if !own.contains_rect(&rect) {
            return Err(Error::size(
                format!("crop {rect} not contained in view of size {}", self.size()),
                Some(rect.size()),
            ));
        }
        let mut out = self.clone();
        out.region = rect.translate(self.region.x, self.region.y);
        Ok(out)
    }

    /// A compact deep copy of the visible region.
    pub fn clone_owned(&self) -> Image {
        let (w, h, ch) = (self.width(), self.height(), self.channels);
        crate::dispatch_kind!(self.kind(), T => {
            let src = <T as Storable>::slice(&self.buf)
                .unwrap_or_else(|| unreachable!("kind dispatched from this image"));
            let mut data = Vec::with_capacity(w as usize * h as usize * ch as usize);
            for y in 0..h {
                let start = self.index(0, y, 0);
                data.extend_from_slice(&src[start..start + w as usize * ch as usize]);
            }
            // geometry was validated when this image was built
            Image::from_vec(w, h, ch, data)
                .unwrap_or_else(|_| unreachable!("geometry already validated"))
        })
    }

    /// Whether both images share the same backing storage.
    #[inline]
    pub fn is_shared_with(&self, other: &Image) -> bool {
        self.buf.ptr_eq(&other.buf)
    }

    #[inline]
    fn index(&self, x: i32, y: i32, c: u32) -> usize {
        debug_assert!(
            x >= 0 && x < self.region.width && y >= 0 && y < self.region.height,
            "pixel ({x}, {y}) out of bounds for view {}",
            self.region
        );
        debug_assert!(c < self.channels, "channel {c} out of range");
        ((self.region.y + y) as usize * self.full.width as usize + (self.region.x + x) as usize)
            * self.channels as usize
            + c as usize
    }

    /// Typed read of channel `c` of pixel (x, y).
    ///
    /// # Panics
    ///
    /// Panics if `T` does not match [`kind`](Image::kind); coordinates are
    /// checked in debug builds only.
    #[inline]
    pub fn pixel<T: Storable>(&self, x: i32, y: i32, c: u32) -> T {
        let s = T::slice(&self.buf)
            .unwrap_or_else(|| panic!("accessing {} image as {}", self.kind(), T::KIND));
        s[self.index(x, y, c)]
    }

    /// Typed write of channel `c` of pixel (x, y). Copy-on-write when the
    /// storage is shared.
    #[inline]
    pub fn set_pixel<T: Storable>(&mut self, x: i32, y: i32, c: u32, value: T) {
        let i = self.index(x, y, c);
        let kind = self.kind();
        let s = T::slice_mut(&mut self.buf)
            .unwrap_or_else(|| panic!("writing {kind} image as {}", T::KIND));
        s[i] = value;
    }

    /// Dynamically-typed read, widened to f64.
    #[inline]
    pub fn value(&self, x: i32, y: i32, c: u32) -> f64 {
        let i = self.index(x, y, c);
        with_buf!(&self.buf, v => v[i].to_f64())
    }

    /// Dynamically-typed write, saturating-cast per the image kind.
    #[inline]
    pub fn set_value(&mut self, x: i32, y: i32, c: u32, value: f64) {
        let i = self.index(x, y, c);
        with_buf!(&mut self.buf, v => {
            let s = Arc::make_mut(v);
            s[i] = Scalar::from_f64(value);
        });
    }

    /// Boolean read: 0 is false, any non-zero value is true.
    #[inline]
    pub fn bool_at(&self, x: i32, y: i32, c: u32) -> bool {
        self.value(x, y, c) != 0.0
    }

    /// Fills the visible region with `value` in every channel.
    pub fn fill(&mut self, value: f64) {
        let (w, h, ch) = (self.width(), self.height(), self.channels);
        crate::dispatch_kind!(self.kind(), T => {
            let v = <T as Scalar>::from_f64(value);
            for y in 0..h {
                let start = self.index(0, y, 0);
                let s = <T as Storable>::slice_mut(&mut self.buf)
                    .unwrap_or_else(|| unreachable!("kind dispatched from this image"));
                s[start..start + w as usize * ch as usize].fill(v);
            }
        });
    }

    /// Copies `src` into this image with its top-left corner at `dst`.
    ///
    /// `src` must fit inside this view and match its kind and channel count.
    /// Used by the tile parallelizer to blit a worker's output into the
    /// parent output stripe. Writing through `self` follows the usual
    /// copy-on-write rule, so call this on the owning image, not on a
    /// shared crop of it.
    pub fn blit(&mut self, src: &Image, dst: crate::Point) -> Result<()> {
        let target = Rect::new(dst.x, dst.y, src.width(), src.height());
        if !Rect::from_size(self.size()).contains_rect(&target) {
            return Err(Error::size(
                format!("blit target {target} not contained in {}", self.size()),
                Some(src.size()),
            ));
        }
        if self.kind() != src.kind() || self.channels != src.channels {
            return Err(Error::image_kind(
                format!(
                    "blit type mismatch: {}x{} vs {}x{}",
                    self.kind(),
                    self.channels,
                    src.kind(),
                    src.channels
                ),
                Some(src.kind()),
            ));
        }
        let row_len = src.width() as usize * src.channels as usize;
        crate::dispatch_kind!(self.kind(), T => {
            for y in 0..src.height() {
                let s_start = src.index(0, y, 0);
                let src_slice = <T as Storable>::slice(&src.buf)
                    .unwrap_or_else(|| unreachable!("kinds checked equal above"));
                let row: Vec<T> = src_slice[s_start..s_start + row_len].to_vec();
                let d_start = self.index(dst.x, dst.y + y, 0);
                let dst_slice = <T as Storable>::slice_mut(&mut self.buf)
                    .unwrap_or_else(|| unreachable!("kinds checked equal above"));
                dst_slice[d_start..d_start + row_len].copy_from_slice(&row);
            }
        });
        Ok(())
    }

    /// Copies pixel values from `src` into this view.
    ///
    /// Both must have the same size, kind and channel count.
    pub fn copy_values_from(&mut self, src: &Image) -> Result<()> {
        if self.size() != src.size() {
            return Err(Error::size(
                format!("copy size mismatch: {} vs {}", self.size(), src.size()),
                Some(src.size()),
            ));
        }
        if self.kind() != src.kind() || self.channels != src.channels {
            return Err(Error::image_kind(
                format!(
                    "copy type mismatch: {}x{} vs {}x{}",
                    self.kind(),
                    self.channels,
                    src.kind(),
                    src.channels
                ),
                Some(src.kind()),
            ));
        }
        let (w, h, ch) = (self.width(), self.height(), self.channels);
        crate::dispatch_kind!(self.kind(), T => {
            for y in 0..h {
                let s_start = src.index(0, y, 0);
                let d_start = self.index(0, y, 0);
                let row_len = w as usize * ch as usize;
                let src_slice = <T as Storable>::slice(&src.buf)
                    .unwrap_or_else(|| unreachable!("kinds checked equal above"));
                let row: Vec<T> = src_slice[s_start..s_start + row_len].to_vec();
                let dst = <T as Storable>::slice_mut(&mut self.buf)
                    .unwrap_or_else(|| unreachable!("kinds checked equal above"));
                dst[d_start..d_start + row_len].copy_from_slice(&row);
            }
        });
        Ok(())
    }

    /// Splits a multi-channel image into per-channel owned images.
    pub fn split(&self) -> Vec<Image> {
        let (w, h) = (self.width(), self.height());
        (0..self.channels)
            .map(|c| {
                crate::dispatch_kind!(self.kind(), T => {
                    let mut data: Vec<T> = Vec::with_capacity(w as usize * h as usize);
                    for y in 0..h {
                        for x in 0..w {
                            data.push(self.pixel::<T>(x, y, c));
                        }
                    }
                    Image::from_vec(w, h, 1, data)
                        .unwrap_or_else(|_| unreachable!("geometry already validated"))
                })
            })
            .collect()
    }

    /// Merges images channel-wise into one image.
    ///
    /// All inputs must have the same size and kind; the output channel count
    /// is the sum of the input channel counts.
    pub fn merge(parts: &[Image]) -> Result<Image> {
        let first = parts
            .first()
            .ok_or_else(|| Error::invalid_argument("merge requires at least one image"))?;
        let (w, h, kind) = (first.width(), first.height(), first.kind());
        let mut total = 0u32;
        for p in parts {
            if p.size() != first.size() {
                return Err(Error::size(
                    format!("merge size mismatch: {} vs {}", p.size(), first.size()),
                    Some(p.size()),
                ));
            }
            if p.kind() != kind {
                return Err(Error::image_kind(
                    format!("merge kind mismatch: {} vs {}", p.kind(), kind),
                    Some(p.kind()),
                ));
            }
            total += p.channels();
        }
        let mut out = Image::new(w, h, kind, total)?;
        let mut c_out = 0u32;
        for p in parts {
            for c in 0..p.channels() {
                for y in 0..h {
                    for x in 0..w {
                        out.set_value(x, y, c_out, p.value(x, y, c));
                    }
                }
                c_out += 1;
            }
        }
        Ok(out)
    }
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("kind", &self.kind())
            .field("channels", &self.channels)
            .field("size", &self.size())
            .field("backing", &self.full)
            .finish()
    }
}

fn check_geometry(width: i32, height: i32, channels: u32) -> Result<()> {
    if width < 0 || height < 0 {
        return Err(Error::size(
            format!("negative image dimensions: {width}x{height}"),
            Some(Size::new(width, height)),
        ));
    }
    if channels == 0 || channels > MAX_CHANNELS {
        return Err(Error::image_kind(
            format!("channel count {channels} outside [1, {MAX_CHANNELS}]"),
            None,
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_and_fill() {
        let mut img = Image::new(4, 3, PixelKind::U8, 2).unwrap();
        assert_eq!(img.size(), Size::new(4, 3));
        assert_eq!(img.kind(), PixelKind::U8);
        img.fill(7.0);
        assert_eq!(img.pixel::<u8>(3, 2, 1), 7);
    }

    #[test]
    fn channel_count_validated() {
        assert!(Image::new(2, 2, PixelKind::U8, 0).is_err());
        assert!(Image::new(2, 2, PixelKind::U8, 26).is_err());
        assert!(Image::new(2, 2, PixelKind::U8, 25).is_ok());
    }

    #[test]
    fn shared_copy_and_cow() {
        let mut a = Image::filled(4, 4, PixelKind::U16, 1, 5.0).unwrap();
        let b = a.shared_copy();
        assert!(a.is_shared_with(&b));

        // writing detaches a's storage, b keeps the old values
        a.set_pixel::<u16>(0, 0, 0, 42);
        assert!(!a.is_shared_with(&b));
        assert_eq!(a.pixel::<u16>(0, 0, 0), 42);
        assert_eq!(b.pixel::<u16>(0, 0, 0), 5);
    }

    #[test]
    fn nested_crops_are_relative() {
        let mut img = Image::new(10, 10, PixelKind::I16, 1).unwrap();
        img.set_pixel::<i16>(5, 6, 0, -3);

        let outer = img.shared_crop(Rect::new(2, 2, 6, 6)).unwrap();
        let inner = outer.shared_crop(Rect::new(1, 1, 4, 4)).unwrap();
        assert!(inner.is_shared_with(&img));
        assert_eq!(inner.pixel::<i16>(2, 3, 0), -3);

        // crop must stay inside the view
        assert!(outer.shared_crop(Rect::new(4, 4, 4, 4)).is_err());
    }

    #[test]
    fn clone_owned_compacts() {
        let mut img = Image::new(6, 6, PixelKind::F32, 2).unwrap();
        img.set_pixel::<f32>(3, 3, 1, 1.5);
        let crop = img.shared_crop(Rect::new(2, 2, 3, 3)).unwrap();
        let owned = crop.clone_owned();
        assert!(!owned.is_shared_with(&img));
        assert_eq!(owned.size(), Size::new(3, 3));
        assert_eq!(owned.pixel::<f32>(1, 1, 1), 1.5);
    }

    #[test]
    fn dynamic_access_saturates() {
        let mut img = Image::new(2, 2, PixelKind::U8, 1).unwrap();
        img.set_value(0, 0, 0, 300.0);
        img.set_value(1, 0, 0, -4.0);
        assert_eq!(img.pixel::<u8>(0, 0, 0), 255);
        assert_eq!(img.pixel::<u8>(1, 0, 0), 0);
        assert!(img.bool_at(0, 0, 0));
        assert!(!img.bool_at(1, 0, 0));
    }

    #[test]
    fn blit_writes_into_owner() {
        use crate::Point;

        let src = Image::filled(4, 4, PixelKind::U8, 1, 9.0).unwrap();
        let mut dst = Image::new(8, 8, PixelKind::U8, 1).unwrap();
        dst.blit(&src, Point::new(2, 2)).unwrap();
        assert_eq!(dst.pixel::<u8>(2, 2, 0), 9);
        assert_eq!(dst.pixel::<u8>(5, 5, 0), 9);
        assert_eq!(dst.pixel::<u8>(1, 1, 0), 0);
        assert_eq!(dst.pixel::<u8>(6, 6, 0), 0);

        // out of bounds target
        assert!(dst.blit(&src, Point::new(6, 6)).is_err());
        // size mismatch through copy_values_from
        let mut stripe = dst.shared_crop(Rect::new(0, 0, 3, 3)).unwrap();
        let small = Image::new(2, 2, PixelKind::U8, 1).unwrap();
        assert!(stripe.copy_values_from(&small).is_err());
    }

    #[test]
    fn split_and_merge_roundtrip() {
        let mut img = Image::new(3, 2, PixelKind::I32, 3).unwrap();
        for c in 0..3 {
            for y in 0..2 {
                for x in 0..3 {
                    img.set_pixel::<i32>(x, y, c, (100 * c as i32) + 10 * y + x);
                }
            }
        }
        let parts = img.split();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].pixel::<i32>(2, 1, 0), 212);

        let merged = Image::merge(&parts).unwrap();
        assert_eq!(merged.channels(), 3);
        for c in 0..3 {
            for y in 0..2 {
                for x in 0..3 {
                    assert_eq!(merged.pixel::<i32>(x, y, c), img.pixel::<i32>(x, y, c));
                }
            }
        }
    }
}
