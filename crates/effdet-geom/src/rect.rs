//! Axis-aligned boxes.
//!
//! These are used for anchors, ground truth, decoded predictions and final detections.

use std::fmt;

use approx::{AbsDiffEq, RelativeEq, UlpsEq};

/// An axis-aligned rectangle.
///
/// Rectangles are allowed to have zero height and/or width. Negative dimensions are not allowed.
///
/// Internally the rectangle is stored in corner form, since that is what IoU, clipping and the
/// final output need. Center-form access goes through [`Rect::center`] and [`Rect::size`].
#[derive(Clone, Copy, PartialEq)]
pub struct Rect {
    left: f32,
    top: f32,
    right: f32,
    bottom: f32,
}

impl Rect {
    /// Creates a rectangle from its corner coordinates `(left, top, right, bottom)`.
    ///
    /// # Panics
    ///
    /// Panics if `right < left` or `bottom < top`.
    #[inline]
    #[track_caller]
    pub fn from_ltrb(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        assert!(left <= right, "left={}, right={}", left, right);
        assert!(top <= bottom, "top={}, bottom={}", top, bottom);
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Creates a rectangle from a corner-form array `[left, top, right, bottom]`.
    #[inline]
    #[track_caller]
    pub fn from_ltrb_array([l, t, r, b]: [f32; 4]) -> Self {
        Self::from_ltrb(l, t, r, b)
    }

    /// Creates a rectangle extending outwards from a center point.
    #[inline]
    #[track_caller]
    pub fn from_center(x_center: f32, y_center: f32, width: f32, height: f32) -> Self {
        let (hw, hh) = (width * 0.5, height * 0.5);
        Self::from_ltrb(x_center - hw, y_center - hh, x_center + hw, y_center + hh)
    }

    /// Creates a rectangle extending downwards and right from a point.
    #[inline]
    #[track_caller]
    pub fn from_top_left(left: f32, top: f32, width: f32, height: f32) -> Self {
        Self::from_ltrb(left, top, left + width, top + height)
    }

    /// Returns the corner form `[left, top, right, bottom]`.
    #[inline]
    pub fn ltrb(&self) -> [f32; 4] {
        [self.left, self.top, self.right, self.bottom]
    }

    #[inline]
    pub fn left(&self) -> f32 {
        self.left
    }

    #[inline]
    pub fn top(&self) -> f32 {
        self.top
    }

    #[inline]
    pub fn right(&self) -> f32 {
        self.right
    }

    #[inline]
    pub fn bottom(&self) -> f32 {
        self.bottom
    }

    #[inline]
    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    #[inline]
    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    /// Returns the center point `(center_x, center_y)`.
    #[inline]
    pub fn center(&self) -> (f32, f32) {
        (
            (self.left + self.right) * 0.5,
            (self.top + self.bottom) * 0.5,
        )
    }

    /// Returns `(width, height)`.
    #[inline]
    pub fn size(&self) -> (f32, f32) {
        (self.width(), self.height())
    }

    /// Returns the area covered by `self`. Never negative.
    #[inline]
    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Scales the width and height of this [`Rect`] by the given amount.
    ///
    /// The center position of the [`Rect`] remains the same.
    #[must_use]
    pub fn scale(&self, scale: f32) -> Self {
        let (xc, yc) = self.center();
        Self::from_center(xc, yc, self.width() * scale, self.height() * scale)
    }

    /// Multiplies every coordinate by `factor`, mapping the rectangle into a uniformly scaled
    /// coordinate system.
    #[must_use]
    pub fn scale_coords(&self, factor: f32) -> Self {
        Self::from_ltrb(
            self.left * factor,
            self.top * factor,
            self.right * factor,
            self.bottom * factor,
        )
    }

    #[must_use]
    pub fn move_by(&self, dx: f32, dy: f32) -> Self {
        Self {
            left: self.left + dx,
            top: self.top + dy,
            right: self.right + dx,
            bottom: self.bottom + dy,
        }
    }

    /// Clamps all corners into `[0, width] x [0, height]`.
    ///
    /// A rectangle entirely outside the area collapses to a zero-area rectangle on its border.
    #[must_use]
    pub fn clip(&self, width: f32, height: f32) -> Self {
        Self {
            left: self.left.clamp(0.0, width),
            top: self.top.clamp(0.0, height),
            right: self.right.clamp(0.0, width),
            bottom: self.bottom.clamp(0.0, height),
        }
    }

    /// Computes the intersection of `self` and `other`.
    ///
    /// Returns [`None`] when the intersection is empty (ie. the rectangles do not overlap).
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let left = self.left.max(other.left);
        let top = self.top.max(other.top);
        let right = self.right.min(other.right);
        let bottom = self.bottom.min(other.bottom);
        if left > right || top > bottom {
            return None;
        }

        Some(Rect {
            left,
            top,
            right,
            bottom,
        })
    }

    pub fn intersection_area(&self, other: &Self) -> f32 {
        self.intersection(other).map_or(0.0, |rect| rect.area())
    }

    pub fn union_area(&self, other: &Self) -> f32 {
        self.area() + other.area() - self.intersection_area(other)
    }

    /// Computes the Intersection over Union (IOU) of `self` and `other`.
    ///
    /// Two zero-area rectangles have an IOU of 0.
    pub fn iou(&self, other: &Self) -> f32 {
        let union = self.union_area(other);
        if union <= 0.0 {
            return 0.0;
        }
        (self.intersection_area(other) / union).clamp(0.0, 1.0)
    }

    pub fn contains_point(&self, x: f32, y: f32) -> bool {
        self.left <= x && self.top <= y && self.right >= x && self.bottom >= y
    }
}

impl fmt::Debug for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Rect @ ({},{})-({},{})",
            self.left, self.top, self.right, self.bottom
        )
    }
}

impl AbsDiffEq for Rect {
    type Epsilon = f32;

    fn default_epsilon() -> f32 {
        f32::default_epsilon()
    }

    fn abs_diff_eq(&self, other: &Self, epsilon: f32) -> bool {
        self.left.abs_diff_eq(&other.left, epsilon)
            && self.top.abs_diff_eq(&other.top, epsilon)
            && self.right.abs_diff_eq(&other.right, epsilon)
            && self.bottom.abs_diff_eq(&other.bottom, epsilon)
    }
}

impl RelativeEq for Rect {
    fn default_max_relative() -> f32 {
        f32::default_max_relative()
    }

    fn relative_eq(&self, other: &Self, epsilon: f32, max_relative: f32) -> bool {
        self.left.relative_eq(&other.left, epsilon, max_relative)
            && self.top.relative_eq(&other.top, epsilon, max_relative)
            && self.right.relative_eq(&other.right, epsilon, max_relative)
            && self.bottom.relative_eq(&other.bottom, epsilon, max_relative)
    }
}

impl UlpsEq for Rect {
    fn default_max_ulps() -> u32 {
        f32::default_max_ulps()
    }

    fn ulps_eq(&self, other: &Self, epsilon: f32, max_ulps: u32) -> bool {
        self.left.ulps_eq(&other.left, epsilon, max_ulps)
            && self.top.ulps_eq(&other.top, epsilon, max_ulps)
            && self.right.ulps_eq(&other.right, epsilon, max_ulps)
            && self.bottom.ulps_eq(&other.bottom, epsilon, max_ulps)
    }
}
