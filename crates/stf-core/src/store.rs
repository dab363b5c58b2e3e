//! The multi-resolution image store.
//!
//! [`MultiResImages`] maps a resolution tag (e.g. `"high"`, `"low"`) and an
//! acquisition date to an [`Image`]. Dates are plain signed labels; only
//! their differences carry meaning. Engines hold the store behind an `Arc`
//! and treat it as read-only while a prediction is running.
//!
//! ```rust
//! use stf_core::{Image, MultiResImages, PixelKind};
//!
//! let mut imgs = MultiResImages::new();
//! imgs.set("low", 3, Image::new(4, 4, PixelKind::U16, 1).unwrap());
//! imgs.set("low", 1, Image::new(4, 4, PixelKind::U16, 1).unwrap());
//! assert!(imgs.has("low", 1));
//! assert_eq!(imgs.dates("low"), vec![1, 3]);
//! ```

use crate::error::{Error, Result};
use crate::image::Image;
use std::collections::BTreeMap;

/// Two-level mapping: resolution tag → date → image.
#[derive(Default)]
pub struct MultiResImages {
    imgs: BTreeMap<String, BTreeMap<i32, Image>>,
}

impl MultiResImages {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves `img` into the store under (tag, date), replacing any previous
    /// entry.
    pub fn set(&mut self, tag: impl Into<String>, date: i32, img: Image) {
        self.imgs.entry(tag.into()).or_default().insert(date, img);
    }

    /// Returns `true` if an image is stored under (tag, date).
    pub fn has(&self, tag: &str, date: i32) -> bool {
        self.imgs.get(tag).is_some_and(|m| m.contains_key(&date))
    }

    /// Borrows the image stored under (tag, date).
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if no such image exists.
    pub fn get(&self, tag: &str, date: i32) -> Result<&Image> {
        self.imgs
            .get(tag)
            .and_then(|m| m.get(&date))
            .ok_or_else(|| Error::not_found(format!("no image for tag '{tag}' at date {date}")))
    }

    /// Borrows any stored image, used for size/type defaults.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the store is empty.
    pub fn get_any(&self) -> Result<&Image> {
        self.imgs
            .values()
            .flat_map(|m| m.values())
            .next()
            .ok_or_else(|| Error::not_found("image store is empty"))
    }

    /// All dates stored for `tag`, ascending. Empty if the tag is unknown.
    pub fn dates(&self, tag: &str) -> Vec<i32> {
        self.imgs
            .get(tag)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Removes and returns the image under (tag, date), if present.
    pub fn remove(&mut self, tag: &str, date: i32) -> Option<Image> {
        let m = self.imgs.get_mut(tag)?;
        let img = m.remove(&date);
        if m.is_empty() {
            self.imgs.remove(tag);
        }
        img
    }

    /// Number of stored images over all tags.
    pub fn len(&self) -> usize {
        self.imgs.values().map(|m| m.len()).sum()
    }

    /// Returns `true` if the store holds no images.
    pub fn is_empty(&self) -> bool {
        self.imgs.is_empty()
    }
}
