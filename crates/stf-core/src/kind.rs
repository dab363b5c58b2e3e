//! Runtime pixel kinds and the compile-time dispatch bridge.
//!
//! Images carry their scalar kind as a runtime tag ([`PixelKind`]) together
//! with a channel count in [1, 25]. Kernels, on the other hand, are written
//! generically over a [`Scalar`] type so the compiler monomorphizes them per
//! kind. The [`dispatch_kind!`] macro is the bridge: it matches a runtime tag
//! and instantiates the generic body with the corresponding Rust type.
//!
//! ```
//! use stf_core::{dispatch_kind, PixelKind, Scalar};
//!
//! fn describe(kind: PixelKind) -> f64 {
//!     dispatch_kind!(kind, T => {
//!         // T is u8, i16, f32, ... depending on `kind`
//!         T::from_f64(1000.0).to_f64()
//!     })
//! }
//! assert_eq!(describe(PixelKind::U8), 255.0); // saturated
//! assert_eq!(describe(PixelKind::F64), 1000.0);
//! ```
//!
//! A restricted dispatch is available through [`ensure_kind_in`], which fails
//! with an image-kind error carrying the offending kind when the tag is not
//! in the permitted set.

use crate::error::{Error, Result};

/// The seven base scalar kinds an image can store.
///
/// Paired with a channel count this forms the "full type" of an image. The
/// base kind and channel count of an [`Image`](crate::Image) are fixed for
/// its lifetime and queryable in O(1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelKind {
    /// Signed 8 bit.
    I8,
    /// Unsigned 8 bit.
    U8,
    /// Signed 16 bit.
    I16,
    /// Unsigned 16 bit.
    U16,
    /// Signed 32 bit.
    I32,
    /// 32 bit float.
    F32,
    /// 64 bit float.
    F64,
}

/// All base kinds, in dispatch order.
pub const ALL_KINDS: [PixelKind; 7] = [
    PixelKind::I8,
    PixelKind::U8,
    PixelKind::I16,
    PixelKind::U16,
    PixelKind::I32,
    PixelKind::F32,
    PixelKind::F64,
];

/// Maximum number of channels an image may carry.
pub const MAX_CHANNELS: u32 = 25;

impl PixelKind {
    /// Size of one scalar in bytes.
    #[inline]
    pub const fn bytes(self) -> usize {
        match self {
            PixelKind::I8 | PixelKind::U8 => 1,
            PixelKind::I16 | PixelKind::U16 => 2,
            PixelKind::I32 | PixelKind::F32 => 4,
            PixelKind::F64 => 8,
        }
    }

    /// Whether this is an integer kind.
    #[inline]
    pub const fn is_integer(self) -> bool {
        !matches!(self, PixelKind::F32 | PixelKind::F64)
    }

    /// Smallest representable value, as f64.
    #[inline]
    pub fn min_value(self) -> f64 {
        match self {
            PixelKind::I8 => i8::MIN as f64,
            PixelKind::U8 => 0.0,
            PixelKind::I16 => i16::MIN as f64,
            PixelKind::U16 => 0.0,
            PixelKind::I32 => i32::MIN as f64,
            PixelKind::F32 => f64::from(f32::MIN),
            PixelKind::F64 => f64::MIN,
        }
    }

    /// Largest representable value, as f64.
    #[inline]
    pub fn max_value(self) -> f64 {
        match self {
            PixelKind::I8 => i8::MAX as f64,
            PixelKind::U8 => u8::MAX as f64,
            PixelKind::I16 => i16::MAX as f64,
            PixelKind::U16 => u16::MAX as f64,
            PixelKind::I32 => i32::MAX as f64,
            PixelKind::F32 => f64::from(f32::MAX),
            PixelKind::F64 => f64::MAX,
        }
    }

    /// Short lowercase name, e.g. `"u16"`.
    pub const fn name(self) -> &'static str {
        match self {
            PixelKind::I8 => "i8",
            PixelKind::U8 => "u8",
            PixelKind::I16 => "i16",
            PixelKind::U16 => "u16",
            PixelKind::I32 => "i32",
            PixelKind::F32 => "f32",
            PixelKind::F64 => "f64",
        }
    }
}

impl std::fmt::Display for PixelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Scalar types an image can store.
///
/// [`from_f64`](Scalar::from_f64) is a saturating cast in the OpenCV sense:
/// for integer targets the value is rounded half-to-even and clamped to the
/// target range; floats pass through (f32 narrows).
pub trait Scalar: Copy + PartialOrd + Send + Sync + std::fmt::Debug + 'static {
    /// The runtime tag corresponding to `Self`.
    const KIND: PixelKind;

    /// Widen to f64.
    fn to_f64(self) -> f64;

    /// Saturating cast from f64.
    fn from_f64(v: f64) -> Self;
}

macro_rules! impl_int_scalar {
    ($t:ty, $kind:expr) => {
        impl Scalar for $t {
            const KIND: PixelKind = $kind;

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }

            #[inline]
            fn from_f64(v: f64) -> Self {
                let r = round_ties_even(v);
                if r <= <$t>::MIN as f64 {
                    <$t>::MIN
                } else if r >= <$t>::MAX as f64 {
                    <$t>::MAX
                } else {
                    r as $t
                }
            }
        }
    };
}

impl_int_scalar!(i8, PixelKind::I8);
impl_int_scalar!(u8, PixelKind::U8);
impl_int_scalar!(i16, PixelKind::I16);
impl_int_scalar!(u16, PixelKind::U16);
impl_int_scalar!(i32, PixelKind::I32);

impl Scalar for f32 {
    const KIND: PixelKind = PixelKind::F32;

    #[inline]
    fn to_f64(self) -> f64 {
        f64::from(self)
    }

    #[inline]
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl Scalar for f64 {
    const KIND: PixelKind = PixelKind::F64;

    #[inline]
    fn to_f64(self) -> f64 {
        self
    }

    #[inline]
    fn from_f64(v: f64) -> Self {
        v
    }
}

/// Round half-to-even, the tie-breaking used by saturating casts.
#[inline]
pub fn round_ties_even(v: f64) -> f64 {
    v.round_ties_even()
}

/// Checks that `kind` is one of `allowed`, failing with an image-kind error
/// that carries the offending kind otherwise.
///
/// Use before [`dispatch_kind!`] when a kernel only supports a subset of the
/// base kinds:
///
/// ```
/// use stf_core::{ensure_kind_in, PixelKind};
///
/// let r = ensure_kind_in(PixelKind::F64, &[PixelKind::U8, PixelKind::U16], "threshold kernel");
/// assert!(r.is_err());
/// ```
pub fn ensure_kind_in(kind: PixelKind, allowed: &[PixelKind], what: &str) -> Result<()> {
    if allowed.contains(&kind) {
        Ok(())
    } else {
        Err(Error::image_kind(
            format!("{what} does not support pixel kind {kind}"),
            Some(kind),
        ))
    }
}

/// Dispatches a runtime [`PixelKind`] to a generic body.
///
/// The body is instantiated once per base kind; the return type must be the
/// same for every kind.
#[macro_export]
macro_rules! dispatch_kind {
    ($kind:expr, $t:ident => $body:expr) => {
        match $kind {
            $crate::PixelKind::I8 => {
                type $t = i8;
                $body
            }
            $crate::PixelKind::U8 => {
                type $t = u8;
                $body
            }
            $crate::PixelKind::I16 => {
                type $t = i16;
                $body
            }
            $crate::PixelKind::U16 => {
                type $t = u16;
                $body
            }
            $crate::PixelKind::I32 => {
                type $t = i32;
                $body
            }
            $crate::PixelKind::F32 => {
                type $t = f32;
                $body
            }
            $crate::PixelKind::F64 => {
                type $t = f64;
                $body
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturating_casts() {
        assert_eq!(u8::from_f64(-3.0), 0);
        assert_eq!(u8::from_f64(300.0), 255);
        assert_eq!(i16::from_f64(1e9), i16::MAX);
        assert_eq!(u16::from_f64(12.4), 12);
        assert_eq!(u16::from_f64(12.6), 13);
        // half-to-even ties
        assert_eq!(u8::from_f64(0.5), 0);
        assert_eq!(u8::from_f64(1.5), 2);
        assert_eq!(u8::from_f64(2.5), 2);
        assert_eq!(i8::from_f64(-0.5), 0);
        assert_eq!(i8::from_f64(-1.5), -2);
    }

    #[test]
    fn dispatch_covers_all_kinds() {
        for kind in ALL_KINDS {
            let bytes = dispatch_kind!(kind, T => std::mem::size_of::<T>());
            assert_eq!(bytes, kind.bytes());
        }
    }

    #[test]
    fn restricted_dispatch_reports_kind() {
        let err =
            ensure_kind_in(PixelKind::I32, &[PixelKind::U8], "mask builder").unwrap_err();
        match err {
            Error::ImageKind { kind, .. } => assert_eq!(kind, Some(PixelKind::I32)),
            _ => unreachable!(),
        }
    }

    #[test]
    fn kind_ranges() {
        assert_eq!(PixelKind::U8.max_value(), 255.0);
        assert_eq!(PixelKind::I16.min_value(), -32768.0);
        assert!(PixelKind::F32.is_integer() == false);
        assert_eq!(PixelKind::F64.bytes(), 8);
    }
}
