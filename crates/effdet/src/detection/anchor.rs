//! Anchor generation over a feature pyramid.
//!
//! Every cell of every pyramid level gets one anchor per `(scale, aspect ratio)` combination. The
//! order of the generated anchors is the order in which the heads flatten their outputs: level,
//! then row, then column, then scale, then aspect ratio. Anything zipping anchors with network
//! outputs relies on that.

use std::{
    collections::HashMap,
    ops::Index,
    sync::{Arc, Mutex},
};

use effdet_geom::Rect;
use itertools::iproduct;

/// Parameters controlling anchor shapes.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorParams {
    /// Ratio of the anchor extent to the stride of its pyramid level.
    pub base_scale: f32,
    /// Size multipliers applied on top of the base size.
    pub scales: Vec<f32>,
    /// `(height, width)` multipliers.
    pub aspect_ratios: Vec<(f32, f32)>,
    /// Pyramid levels, as exponents of 2.
    pub pyramid_levels: Vec<u32>,
}

impl AnchorParams {
    /// Number of anchors placed on each feature map cell.
    pub fn variants_per_cell(&self) -> usize {
        self.scales.len() * self.aspect_ratios.len()
    }
}

#[derive(Debug, Clone, Copy)]
struct LevelInfo {
    level: u32,
    grid: usize,
    /// Index of the first anchor of this level.
    offset: usize,
}

/// The anchors for one canvas size.
#[derive(Debug, Clone)]
pub struct Anchors {
    rects: Vec<Rect>,
    levels: Vec<LevelInfo>,
    variants_per_cell: usize,
    canvas_size: u32,
}

impl Anchors {
    /// Computes all anchors for a square canvas of `canvas_size` pixels.
    ///
    /// # Panics
    ///
    /// Panics if `canvas_size` is 0 or `params` has no scales or aspect ratios.
    pub fn calculate(params: &AnchorParams, canvas_size: u32) -> Self {
        assert_ne!(canvas_size, 0, "canvas size must be non-zero");
        assert_ne!(params.variants_per_cell(), 0, "no anchor variants configured");

        let mut rects = Vec::new();
        let mut levels = Vec::with_capacity(params.pyramid_levels.len());

        for &level in &params.pyramid_levels {
            let stride = 2u32.pow(level);
            let grid = canvas_size.div_ceil(stride) as usize;
            let stride = stride as f32;
            let base_size = params.base_scale * stride;

            levels.push(LevelInfo {
                level,
                grid,
                offset: rects.len(),
            });
            rects.reserve(grid * grid * params.variants_per_cell());

            for (row, col, &scale, &(ratio_h, ratio_w)) in
                iproduct!(0..grid, 0..grid, &params.scales, &params.aspect_ratios)
            {
                let x_center = (col as f32 + 0.5) * stride;
                let y_center = (row as f32 + 0.5) * stride;
                let size = base_size * scale;
                rects.push(Rect::from_center(
                    x_center,
                    y_center,
                    size * ratio_w,
                    size * ratio_h,
                ));
            }
        }

        Self {
            rects,
            levels,
            variants_per_cell: params.variants_per_cell(),
            canvas_size,
        }
    }

    /// Returns the total number of anchors.
    pub fn anchor_count(&self) -> usize {
        self.rects.len()
    }

    pub fn canvas_size(&self) -> u32 {
        self.canvas_size
    }

    pub fn as_slice(&self) -> &[Rect] {
        &self.rects
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rect> + '_ {
        self.rects.iter()
    }

    /// Yields `(level, anchor count)` for every pyramid level, in order.
    pub fn level_counts(&self) -> impl Iterator<Item = (u32, usize)> + '_ {
        let per_cell = self.variants_per_cell;
        self.levels
            .iter()
            .map(move |info| (info.level, info.grid * info.grid * per_cell))
    }

    /// Returns the index of the anchor at the given pyramid `level`, grid cell and variant.
    ///
    /// `variant` is `scale_index * num_aspect_ratios + aspect_ratio_index`.
    pub fn index_of(&self, level: u32, row: usize, col: usize, variant: usize) -> Option<usize> {
        let info = self.levels.iter().find(|info| info.level == level)?;
        if row >= info.grid || col >= info.grid || variant >= self.variants_per_cell {
            return None;
        }
        Some(info.offset + (row * info.grid + col) * self.variants_per_cell + variant)
    }
}

impl Index<usize> for Anchors {
    type Output = Rect;

    fn index(&self, index: usize) -> &Rect {
        &self.rects[index]
    }
}

/// Computes anchors and caches them per canvas size.
///
/// Cached [`Anchors`] are immutable and handed out as [`Arc`]s, so any number of threads can read
/// them concurrently.
pub struct AnchorGenerator {
    params: AnchorParams,
    cache: Mutex<HashMap<u32, Arc<Anchors>>>,
}

impl AnchorGenerator {
    pub fn new(params: AnchorParams) -> Self {
        Self {
            params,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn params(&self) -> &AnchorParams {
        &self.params
    }

    /// Returns the anchors for `canvas_size`, computing them on first use.
    pub fn anchors(&self, canvas_size: u32) -> Arc<Anchors> {
        let mut cache = self.cache.lock().unwrap();
        if let Some(anchors) = cache.get(&canvas_size) {
            log::trace!("anchor cache hit for canvas size {}", canvas_size);
            return anchors.clone();
        }

        let anchors = Arc::new(Anchors::calculate(&self.params, canvas_size));
        log::debug!(
            "generated {} anchors for canvas size {}",
            anchors.anchor_count(),
            canvas_size
        );
        cache.insert(canvas_size, anchors.clone());
        anchors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectorConfig;

    fn default_params() -> AnchorParams {
        DetectorConfig::default().anchor_params()
    }

    #[test]
    fn anchor_count() {
        let anchors = Anchors::calculate(&default_params(), 512);
        // 64² + 32² + 16² + 8² + 4² cells, 9 variants each
        assert_eq!(anchors.anchor_count(), (4096 + 1024 + 256 + 64 + 16) * 9);
        assert_eq!(
            anchors.level_counts().collect::<Vec<_>>(),
            [
                (3, 4096 * 9),
                (4, 1024 * 9),
                (5, 256 * 9),
                (6, 64 * 9),
                (7, 16 * 9)
            ]
        );
    }

    #[test]
    fn grid_rounds_up() {
        let params = AnchorParams {
            base_scale: 4.0,
            scales: vec![1.0],
            aspect_ratios: vec![(1.0, 1.0)],
            pyramid_levels: vec![7],
        };
        // ceil(200 / 128) = 2
        let anchors = Anchors::calculate(&params, 200);
        assert_eq!(anchors.anchor_count(), 4);
    }

    #[test]
    fn deterministic() {
        let a = Anchors::calculate(&default_params(), 640);
        let b = Anchors::calculate(&default_params(), 640);
        assert_eq!(a.anchor_count(), b.anchor_count());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.ltrb().map(f32::to_bits), y.ltrb().map(f32::to_bits));
        }
    }

    #[test]
    fn ordering() {
        let params = default_params();
        let anchors = Anchors::calculate(&params, 512);

        // First anchor: level 3, cell (0, 0), scale 1, ratio (1, 1).
        assert_eq!(anchors[0], Rect::from_center(4.0, 4.0, 32.0, 32.0));
        // Aspect ratio varies fastest: (0.7 h, 1.4 w).
        let r = anchors[1];
        assert!((r.center().0 - 4.0).abs() < 1e-4 && (r.center().1 - 4.0).abs() < 1e-4);
        assert!((r.width() - 32.0 * 1.4).abs() < 1e-4);
        assert!((r.height() - 32.0 * 0.7).abs() < 1e-4);
        // Then scale.
        assert!((anchors[3].width() - 32.0 * 2f32.powf(1.0 / 3.0)).abs() < 1e-4);
        // Then column.
        assert_eq!(anchors[9].center(), (12.0, 4.0));
        // Then row.
        assert_eq!(anchors[64 * 9].center(), (4.0, 12.0));

        let idx = anchors.index_of(5, 4, 4, 0).unwrap();
        assert_eq!(idx, (4096 + 1024) * 9 + (4 * 16 + 4) * 9);
        assert_eq!(anchors[idx], Rect::from_ltrb(80.0, 80.0, 208.0, 208.0));
        assert_eq!(anchors.index_of(5, 16, 0, 0), None);
        assert_eq!(anchors.index_of(2, 0, 0, 0), None);
    }

    #[test]
    fn cache_shares_anchors() {
        let gen = AnchorGenerator::new(default_params());
        let a = gen.anchors(512);
        let b = gen.anchors(512);
        assert!(Arc::ptr_eq(&a, &b));

        let c = gen.anchors(640);
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(c.canvas_size(), 640);
    }
}
