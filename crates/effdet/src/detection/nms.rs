//! Non-Maximum Suppression.
//!
//! Dense detectors produce many overlapping candidates for every object. Non-Maximum Suppression
//! (NMS) keeps the most confident candidate and drops every other one that overlaps it too much,
//! repeating until no candidates are left.
//!
//! [`NonMaxSuppression`] works on a list of candidates of a single class; cross-class suppression
//! is the caller's business (and [`PostProcess`](super::postprocess::PostProcess) does not do it).

use std::cmp::Reverse;

use effdet_geom::num::TotalF32;

use super::Detection;

/// A non-maximum suppression algorithm.
pub struct NonMaxSuppression {
    iou_thresh: f32,
    out_buf: Vec<Detection>,
}

impl NonMaxSuppression {
    /// The default intersection-over-union threshold used to determine if two detections overlap.
    pub const DEFAULT_IOU_THRESH: f32 = 0.5;

    /// Creates a new non-maximum suppressor using [`Self::DEFAULT_IOU_THRESH`].
    pub fn new() -> Self {
        Self {
            iou_thresh: Self::DEFAULT_IOU_THRESH,
            out_buf: Vec::new(),
        }
    }

    /// Sets the intersection-over-union threshold at which a detection suppresses another one.
    pub fn set_iou_thresh(&mut self, iou_thresh: f32) {
        self.iou_thresh = iou_thresh;
    }

    pub fn iou_thresh(&self) -> f32 {
        self.iou_thresh
    }

    /// Performs non-maximum suppression on `detections`.
    ///
    /// `detections` is drained in the process. The surviving detections are returned in order of
    /// descending score; candidates with equal scores keep their relative order.
    pub fn process(
        &mut self,
        detections: &mut Vec<Detection>,
    ) -> impl Iterator<Item = Detection> + '_ {
        self.out_buf.clear();

        detections.sort_by_key(|det| Reverse(TotalF32(det.score())));

        for candidate in detections.drain(..) {
            let rect = candidate.bounding_rect();
            let suppressed = self
                .out_buf
                .iter()
                .any(|kept| kept.bounding_rect().iou(&rect) >= self.iou_thresh);
            if !suppressed {
                self.out_buf.push(candidate);
            }
        }

        self.out_buf.drain(..)
    }
}

impl Default for NonMaxSuppression {
    fn default() -> Self {
        Self::new()
    }
}
