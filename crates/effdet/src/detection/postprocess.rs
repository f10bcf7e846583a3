//! Turns raw head outputs into final per-image detections.

use effdet_geom::Rect;
use ndarray::{ArrayView2, ArrayView3, Axis};
use rayon::prelude::*;

use crate::{coder::BoxCoder, config::ScoreActivation, head::Deltas, preprocess::CanvasMeta};

use super::{nms::NonMaxSuppression, Detection, Detections, ImageDetections};

/// Decoding, score thresholding and per-class non-maximum suppression.
///
/// Every anchor yields at most one candidate: its highest scoring class (the lowest class index
/// wins ties). Candidates scoring below the score threshold are dropped, the rest are decoded,
/// clipped to the canvas and suppressed per class. Survivors are mapped back to original image
/// coordinates.
#[derive(Debug, Clone)]
pub struct PostProcess {
    score_thresh: f32,
    nms_thresh: f32,
    coder: BoxCoder,
    activation: ScoreActivation,
}

impl Default for PostProcess {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SCORE_THRESH, Self::DEFAULT_NMS_THRESH)
    }
}

impl PostProcess {
    pub const DEFAULT_SCORE_THRESH: f32 = 0.5;
    pub const DEFAULT_NMS_THRESH: f32 = NonMaxSuppression::DEFAULT_IOU_THRESH;

    pub fn new(score_thresh: f32, nms_thresh: f32) -> Self {
        Self {
            score_thresh,
            nms_thresh,
            coder: BoxCoder::new(),
            activation: ScoreActivation::Sigmoid,
        }
    }

    pub fn set_activation(&mut self, activation: ScoreActivation) {
        self.activation = activation;
    }

    pub fn score_thresh(&self) -> f32 {
        self.score_thresh
    }

    pub fn nms_thresh(&self) -> f32 {
        self.nms_thresh
    }

    /// Produces the detections of every image in the batch.
    ///
    /// - `classifications`: `[batch, anchors, classes]` raw classification outputs.
    /// - `regressions`: `[batch, anchors, 4]` deltas.
    /// - `anchors`: the anchors of the canvas, in head output order.
    /// - `metas`: one [`CanvasMeta`] per image.
    ///
    /// # Panics
    ///
    /// Panics if the batch sizes or anchor counts of the inputs disagree.
    pub fn process(
        &self,
        classifications: ArrayView3<'_, f32>,
        regressions: &Deltas,
        anchors: &[Rect],
        metas: &[CanvasMeta],
    ) -> Vec<ImageDetections> {
        let batch = metas.len();
        assert_eq!(
            classifications.shape()[0],
            batch,
            "classification batch size does not match the number of images"
        );
        assert_eq!(
            regressions.batch_size(),
            batch,
            "regression batch size does not match the number of images"
        );
        assert_eq!(
            classifications.shape()[1],
            anchors.len(),
            "classification output covers {} anchors, expected {}",
            classifications.shape()[1],
            anchors.len()
        );
        assert_eq!(
            regressions.anchor_count(),
            anchors.len(),
            "regression output covers {} anchors, expected {}",
            regressions.anchor_count(),
            anchors.len()
        );

        (0..batch)
            .into_par_iter()
            .map(|i| {
                self.process_image(
                    classifications.index_axis(Axis(0), i),
                    regressions.image(i),
                    anchors,
                    &metas[i],
                )
            })
            .collect()
    }

    fn process_image(
        &self,
        classifications: ArrayView2<'_, f32>,
        regressions: ArrayView2<'_, f32>,
        anchors: &[Rect],
        meta: &CanvasMeta,
    ) -> ImageDetections {
        let canvas = meta.canvas_size() as f32;
        let mut candidates = Detections::new();
        for ((anchor, scores), delta) in anchors
            .iter()
            .zip(classifications.rows())
            .zip(regressions.rows())
        {
            let Some((class, raw)) = argmax(scores.iter().copied()) else {
                continue;
            };
            let score = self.activation.apply(raw);
            // NaN scores fail this too.
            if !(score >= self.score_thresh) {
                continue;
            }

            let delta = [delta[0], delta[1], delta[2], delta[3]];
            if delta.iter().any(|d| !d.is_finite()) {
                log::trace!("skipping candidate with non-finite deltas {:?}", delta);
                continue;
            }

            let rect = self.coder.decode(anchor, delta).clip(canvas, canvas);
            candidates.push(Detection::new(rect, class as u32, score));
        }

        let num_candidates = candidates.len();
        let mut nms = NonMaxSuppression::new();
        nms.set_iou_thresh(self.nms_thresh);
        let mut kept = Vec::with_capacity(num_candidates);
        for class in candidates.classes_mut() {
            kept.extend(nms.process(class));
        }

        kept.sort_by(|a: &Detection, b: &Detection| b.score().total_cmp(&a.score()));
        log::trace!(
            "{} candidates above {}, {} after NMS",
            num_candidates,
            self.score_thresh,
            kept.len()
        );

        kept.into_iter()
            .map(|mut det| {
                det.set_bounding_rect(meta.to_original(det.bounding_rect()));
                det
            })
            .collect()
    }
}

/// Returns the index and value of the largest element; the first one on ties. NaNs are skipped.
fn argmax(values: impl Iterator<Item = f32>) -> Option<(usize, f32)> {
    values
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .fold(None, |best, (i, v)| match best {
            Some((_, b)) if v <= b => best,
            _ => Some((i, v)),
        })
}

#[cfg(test)]
mod tests {
    use ndarray::Array3;

    use super::*;

    fn canvas(size: u32) -> CanvasMeta {
        CanvasMeta::identity(size)
    }

    #[test]
    fn argmax_prefers_first() {
        assert_eq!(argmax([0.1, 0.7, 0.7, 0.2].into_iter()), Some((1, 0.7)));
        assert_eq!(argmax(std::iter::empty::<f32>()), None);
        assert_eq!(argmax([f32::NAN, 0.3, f32::NAN].into_iter()), Some((1, 0.3)));
        assert_eq!(argmax([f32::NAN; 2].into_iter()), None);
    }

    #[test]
    fn nan_class_does_not_hide_anchor() {
        let anchors = [Rect::from_ltrb(0.0, 0.0, 10.0, 10.0)];
        let mut cls = Array3::zeros((1, 1, 2));
        cls[[0, 0, 0]] = f32::NAN;
        cls[[0, 0, 1]] = 0.99;
        let reg = Deltas::from_xywh(Array3::zeros((1, 1, 4)));
        let mut post = PostProcess::new(0.5, 0.5);
        post.set_activation(ScoreActivation::Identity);

        let out = post.process(cls.view(), &reg, &anchors, &[canvas(128)]);
        assert_eq!(out[0].labels, [1]);
        assert_eq!(out[0].scores, [0.99]);
    }

    #[test]
    fn nothing_above_threshold() {
        let anchors = [Rect::from_ltrb(0.0, 0.0, 10.0, 10.0); 3];
        let cls = Array3::from_elem((1, 3, 4), 0.2);
        let reg = Deltas::from_xywh(Array3::zeros((1, 3, 4)));
        let mut post = PostProcess::default();
        post.set_activation(ScoreActivation::Identity);

        let out = post.process(cls.view(), &reg, &anchors, &[canvas(128)]);
        assert_eq!(out.len(), 1);
        assert!(out[0].is_empty());
    }

    #[test]
    fn one_candidate_per_anchor() {
        let anchors = [Rect::from_ltrb(0.0, 0.0, 10.0, 10.0)];
        let mut cls = Array3::zeros((1, 1, 3));
        cls[[0, 0, 1]] = 0.9;
        cls[[0, 0, 2]] = 0.8;
        let reg = Deltas::from_xywh(Array3::zeros((1, 1, 4)));
        let mut post = PostProcess::new(0.5, 0.5);
        post.set_activation(ScoreActivation::Identity);

        let out = post.process(cls.view(), &reg, &anchors, &[canvas(128)]);
        assert_eq!(out[0].labels, [1]);
        assert_eq!(out[0].scores, [0.9]);
        assert_eq!(out[0].boxes, [[0.0, 0.0, 10.0, 10.0]]);
    }

    #[test]
    fn suppression_is_per_class() {
        let rect = Rect::from_ltrb(10.0, 10.0, 50.0, 50.0);
        let anchors = [rect, rect, rect];
        let mut cls = Array3::zeros((1, 3, 2));
        cls[[0, 0, 0]] = 0.7;
        cls[[0, 1, 0]] = 0.8;
        cls[[0, 2, 1]] = 0.6;
        let reg = Deltas::from_xywh(Array3::zeros((1, 3, 4)));
        let mut post = PostProcess::new(0.5, 0.5);
        post.set_activation(ScoreActivation::Identity);

        let out = post.process(cls.view(), &reg, &anchors, &[canvas(128)]);
        assert_eq!(out[0].labels, [0, 1]);
        assert_eq!(out[0].scores, [0.8, 0.6]);
    }

    #[test]
    fn boxes_are_clipped_and_mapped_back() {
        let anchors = [Rect::from_ltrb(100.0, 100.0, 160.0, 160.0)];
        let mut cls = Array3::zeros((1, 1, 1));
        cls[[0, 0, 0]] = 5.0;
        let reg = Deltas::from_xywh(Array3::zeros((1, 1, 4)));
        let post = PostProcess::default();

        // a 256x64 image on a 128 canvas is scaled by 0.5
        let meta = CanvasMeta::new(128, 256, 64);
        let out = post.process(cls.view(), &reg, &anchors, &[meta]);
        assert_eq!(out[0].len(), 1);
        assert!((out[0].scores[0] - effdet_geom::num::sigmoid(5.0)).abs() < 1e-6);
        let [l, t, r, b] = out[0].boxes[0];
        assert!((l - 200.0).abs() < 1e-3, "{l}");
        assert!((t - 200.0).abs() < 1e-3, "{t}");
        assert!((r - 256.0).abs() < 1e-3, "{r}");
        assert!((b - 256.0).abs() < 1e-3, "{b}");
    }

    #[test]
    fn skips_non_finite_deltas() {
        let anchors = [Rect::from_ltrb(0.0, 0.0, 10.0, 10.0); 2];
        let cls = Array3::from_elem((1, 2, 1), 0.9);
        let mut reg = Array3::zeros((1, 2, 4));
        reg[[0, 0, 0]] = f32::NAN;
        let mut post = PostProcess::default();
        post.set_activation(ScoreActivation::Identity);

        let out = post.process(cls.view(), &Deltas::from_xywh(reg), &anchors, &[canvas(128)]);
        assert_eq!(out[0].len(), 1);
    }

    #[test]
    #[should_panic(expected = "covers 2 anchors, expected 3")]
    fn anchor_count_mismatch() {
        let anchors = [Rect::from_ltrb(0.0, 0.0, 10.0, 10.0); 3];
        let cls = Array3::zeros((1, 2, 1));
        let reg = Deltas::from_xywh(Array3::zeros((1, 2, 4)));
        PostProcess::default().process(cls.view(), &reg, &anchors, &[canvas(128)]);
    }
}
