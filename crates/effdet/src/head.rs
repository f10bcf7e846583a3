//! The boundary between the network heads and the rest of the pipeline.
//!
//! The pretrained regression heads emit deltas as `(y, x, h, w)`, while everything downstream
//! works with `(x, y, w, h)`. The reordering happens in exactly one place,
//! [`Deltas::from_legacy_order`], and the loss and post-processing only accept [`Deltas`], so
//! forgetting the swap (or applying it twice) does not compile.

use ndarray::{concatenate, Array3, ArrayView2, ArrayView3, Axis};

/// Per-anchor regression deltas in `(x, y, w, h)` order, shaped `[batch, anchors, 4]`.
#[derive(Debug, Clone)]
pub struct Deltas(Array3<f32>);

impl Deltas {
    /// Converts raw head output in the legacy `(y, x, h, w)` order.
    pub fn from_legacy_order(mut raw: Array3<f32>) -> Self {
        assert_eq!(
            raw.shape()[2],
            4,
            "regression output must have 4 values per anchor, got shape {:?}",
            raw.shape()
        );
        for mut delta in raw.rows_mut() {
            delta.swap(0, 1);
            delta.swap(2, 3);
        }
        Self(raw)
    }

    /// Wraps deltas that already are in `(x, y, w, h)` order.
    pub fn from_xywh(deltas: Array3<f32>) -> Self {
        assert_eq!(
            deltas.shape()[2],
            4,
            "regression output must have 4 values per anchor, got shape {:?}",
            deltas.shape()
        );
        Self(deltas)
    }

    pub fn batch_size(&self) -> usize {
        self.0.shape()[0]
    }

    pub fn anchor_count(&self) -> usize {
        self.0.shape()[1]
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.0.view()
    }

    /// Returns the `[anchors, 4]` deltas of one image.
    pub fn image(&self, index: usize) -> ArrayView2<'_, f32> {
        self.0.index_axis(Axis(0), index)
    }

    pub fn into_inner(self) -> Array3<f32> {
        self.0
    }
}

/// Raw output of the classification and regression heads for a batch.
///
/// `classifications` is `[batch, anchors, classes]`, `regressions` is `[batch, anchors, 4]` in the
/// legacy `(y, x, h, w)` order.
#[derive(Debug, Clone)]
pub struct HeadOutputs {
    pub classifications: Array3<f32>,
    pub regressions: Array3<f32>,
}

impl HeadOutputs {
    /// Concatenates per-level head outputs (in pyramid level order) along the anchor axis.
    ///
    /// # Panics
    ///
    /// Panics if the level lists are empty or differ in length, or if any level's shapes disagree
    /// with the others.
    pub fn from_levels(classifications: &[Array3<f32>], regressions: &[Array3<f32>]) -> Self {
        assert!(!classifications.is_empty(), "no pyramid levels given");
        assert_eq!(
            classifications.len(),
            regressions.len(),
            "classification and regression outputs cover a different number of levels"
        );

        let batch = classifications[0].shape()[0];
        let classes = classifications[0].shape()[2];
        for (level, (cls, reg)) in classifications.iter().zip(regressions).enumerate() {
            assert_eq!(
                cls.shape()[..2],
                reg.shape()[..2],
                "level {}: classification shape {:?} does not match regression shape {:?}",
                level,
                cls.shape(),
                reg.shape()
            );
            assert_eq!(cls.shape()[0], batch, "level {}: batch size mismatch", level);
            assert_eq!(cls.shape()[2], classes, "level {}: class count mismatch", level);
            assert_eq!(reg.shape()[2], 4, "level {}: expected 4 deltas", level);
        }

        let cls_views = classifications.iter().map(|a| a.view()).collect::<Vec<_>>();
        let reg_views = regressions.iter().map(|a| a.view()).collect::<Vec<_>>();
        Self {
            classifications: concatenate(Axis(1), &cls_views)
                .expect("level shapes were checked above"),
            regressions: concatenate(Axis(1), &reg_views)
                .expect("level shapes were checked above"),
        }
    }

    /// Splits the outputs, bringing the regressions into `(x, y, w, h)` order.
    pub fn into_parts(self) -> (Array3<f32>, Deltas) {
        (
            self.classifications,
            Deltas::from_legacy_order(self.regressions),
        )
    }
}
