//! Conversion between boxes and anchor-relative regression deltas.
//!
//! Deltas are always in `(x, y, w, h)` order:
//!
//! ```text
//! dx = (gt.cx - anchor.cx) / anchor.w
//! dy = (gt.cy - anchor.cy) / anchor.h
//! dw = ln(gt.w / anchor.w)
//! dh = ln(gt.h / anchor.h)
//! ```

use effdet_geom::Rect;

/// Encodes boxes relative to anchors and decodes predicted deltas back into boxes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxCoder {
    size_clip: f32,
}

impl Default for BoxCoder {
    fn default() -> Self {
        Self::new()
    }
}

impl BoxCoder {
    /// Default bound on the magnitude of the log-space size deltas during decoding.
    pub const DEFAULT_SIZE_CLIP: f32 = 4.0;

    pub fn new() -> Self {
        Self {
            size_clip: Self::DEFAULT_SIZE_CLIP,
        }
    }

    /// Creates a coder that clamps `dw`/`dh` to `[-size_clip, size_clip]` before exponentiating.
    pub fn with_size_clip(size_clip: f32) -> Self {
        assert!(size_clip > 0.0, "size_clip must be positive");
        Self { size_clip }
    }

    /// Computes the regression target that maps `anchor` onto `gt`.
    ///
    /// Both boxes must have a positive width and height.
    pub fn encode(&self, anchor: &Rect, gt: &Rect) -> [f32; 4] {
        let (ax, ay) = anchor.center();
        let (aw, ah) = anchor.size();
        let (gx, gy) = gt.center();
        let (gw, gh) = gt.size();
        [
            (gx - ax) / aw,
            (gy - ay) / ah,
            (gw / aw).ln(),
            (gh / ah).ln(),
        ]
    }

    /// Applies predicted `delta` to `anchor`.
    ///
    /// Size deltas are clamped first, so arbitrarily large network outputs still produce finite
    /// boxes.
    pub fn decode(&self, anchor: &Rect, delta: [f32; 4]) -> Rect {
        let [dx, dy, dw, dh] = delta;
        let dw = dw.clamp(-self.size_clip, self.size_clip);
        let dh = dh.clamp(-self.size_clip, self.size_clip);

        let (ax, ay) = anchor.center();
        let (aw, ah) = anchor.size();
        Rect::from_center(ax + dx * aw, ay + dy * ah, aw * dw.exp(), ah * dh.exp())
    }
}
