//! 2-D moving-window sums with the additive/subtractive sliding update.
//!
//! For two equally-sized images X and Y and a window size S, every pixel
//! (u, v) gets the five sums over the valid pixels of the S×S window
//! centered at it:
//!
//! ```text
//! Σx, Σy, Σx², Σxy, n
//! ```
//!
//! The window is initialized once; moving down one row adds the entering
//! row and subtracts the leaving one, moving right one column does the same
//! with columns. Cost is O(W·H) per channel, independent of S. Windows that
//! reach outside the image contribute only their in-bounds part; masked
//! pixels do not contribute at all.

use stf_core::{dispatch_kind, Error, Image, Rect, Result, Scalar, Storable};

/// The five sums over the valid pixels of one window position.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowSums {
    /// Σx over valid pixels of X.
    pub sum_x: f64,
    /// Σy over valid pixels of Y.
    pub sum_y: f64,
    /// Σx² over valid pixels of X.
    pub sum_xx: f64,
    /// Σxy over valid pixels.
    pub sum_xy: f64,
    /// Count of valid pixels.
    pub n: i64,
}

impl std::ops::AddAssign for WindowSums {
    fn add_assign(&mut self, s: Self) {
        self.sum_x += s.sum_x;
        self.sum_y += s.sum_y;
        self.sum_xx += s.sum_xx;
        self.sum_xy += s.sum_xy;
        self.n += s.n;
    }
}

impl std::ops::SubAssign for WindowSums {
    fn sub_assign(&mut self, s: Self) {
        self.sum_x -= s.sum_x;
        self.sum_y -= s.sum_y;
        self.sum_xx -= s.sum_xx;
        self.sum_xy -= s.sum_xy;
        self.n -= s.n;
    }
}

fn check_inputs(
    x_img: &Image,
    y_img: &Image,
    mask: Option<&Image>,
    window_size: i32,
    channel: u32,
) -> Result<()> {
    if x_img.size() != y_img.size() {
        return Err(Error::size(
            format!("window sums: sizes differ {} vs {}", x_img.size(), y_img.size()),
            Some(y_img.size()),
        ));
    }
    if window_size < 1 || window_size % 2 == 0 {
        return Err(Error::invalid_argument(format!(
            "window size must be odd and >= 1, got {window_size}"
        )));
    }
    if channel >= x_img.channels() || channel >= y_img.channels() {
        return Err(Error::invalid_argument(format!(
            "channel {channel} out of range for inputs"
        )));
    }
    if let Some(m) = mask {
        if m.size() != x_img.size() {
            return Err(Error::size(
                format!("window sums: mask size {} differs from {}", m.size(), x_img.size()),
                Some(m.size()),
            ));
        }
        if m.channels() != 1 {
            return Err(Error::image_kind(
                "window sums expect a single-channel mask".to_string(),
                Some(m.kind()),
            ));
        }
    }
    Ok(())
}

/// Runs `visit(x, y, sums)` for every pixel of `x_img` in row-major order,
/// where `sums` holds the window sums of the `window_size` × `window_size`
/// window centered at (x, y).
///
/// X values are taken from `x_img`, Y values from `y_img`, both in
/// `channel`. Pixels marked invalid in the optional single-channel mask are
/// skipped.
pub fn sliding_window_sums<F>(
    x_img: &Image,
    y_img: &Image,
    mask: Option<&Image>,
    window_size: i32,
    channel: u32,
    visit: F,
) -> Result<()>
where
    F: FnMut(i32, i32, &WindowSums),
{
    check_inputs(x_img, y_img, mask, window_size, channel)?;
    dispatch_kind!(x_img.kind(), T => {
        slide::<T, F>(x_img, y_img, mask, window_size, channel, visit)
    });
    Ok(())
}

fn slide<T: Storable, F>(
    x_img: &Image,
    y_img: &Image,
    mask: Option<&Image>,
    window_size: i32,
    channel: u32,
    mut visit: F,
) where
    F: FnMut(i32, i32, &WindowSums),
{
    let w = x_img.width();
    let h = x_img.height();
    let bounds = Rect::new(0, 0, w, h);
    let half = window_size / 2;

    let collect = |rect: Rect| -> WindowSums {
        let r = rect.intersect(&bounds);
        let mut s = WindowSums::default();
        for y in r.y..r.bottom() {
            for x in r.x..r.right() {
                if let Some(m) = mask {
                    if !m.bool_at(x, y, 0) {
                        continue;
                    }
                }
                let xv = x_img.pixel::<T>(x, y, channel).to_f64();
                let yv = y_img.pixel::<T>(x, y, channel).to_f64();
                s.sum_x += xv;
                s.sum_y += yv;
                s.sum_xx += xv * xv;
                s.sum_xy += xv * yv;
                s.n += 1;
            }
        }
        s
    };

    // sums for the window centered at the start of the current row
    let mut row_sums = collect(Rect::new(-half, -half, window_size, window_size));

    for y in 0..h {
        if y != 0 {
            // leaving top row, entering bottom row
            let top = y - half - 1;
            let bottom = y + half;
            row_sums -= collect(Rect::new(-half, top, window_size, 1));
            row_sums += collect(Rect::new(-half, bottom, window_size, 1));
        }

        let mut sums = row_sums;
        for x in 0..w {
            if x != 0 {
                // leaving left column, entering right column
                let left = x - half - 1;
                let right = x + half;
                sums -= collect(Rect::new(left, y - half, 1, window_size));
                sums += collect(Rect::new(right, y - half, 1, window_size));
            }
            visit(x, y, &sums);
        }
    }
}

/// Naive O(S²) reference used to validate the sliding update.
pub fn naive_window_sums(
    x_img: &Image,
    y_img: &Image,
    mask: Option<&Image>,
    window_size: i32,
    channel: u32,
    x: i32,
    y: i32,
) -> Result<WindowSums> {
    check_inputs(x_img, y_img, mask, window_size, channel)?;
    let half = window_size / 2;
    let bounds = Rect::new(0, 0, x_img.width(), x_img.height());
    let win = Rect::new(x - half, y - half, window_size, window_size).intersect(&bounds);
    let mut s = WindowSums::default();
    for v in win.y..win.bottom() {
        for u in win.x..win.right() {
            if let Some(m) = mask {
                if !m.bool_at(u, v, 0) {
                    continue;
                }
            }
            let xv = x_img.value(u, v, channel);
            let yv = y_img.value(u, v, channel);
            s.sum_x += xv;
            s.sum_y += yv;
            s.sum_xx += xv * xv;
            s.sum_xy += xv * yv;
            s.n += 1;
        }
    }
    Ok(s)
}
