//! IoU-based assignment of anchors to ground truth.

use std::ops::Index;

use effdet_geom::Rect;
use ndarray::Array2;

/// Outcome of matching one anchor against an image's ground truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    /// The anchor overlaps the ground truth box with the given index well enough to learn it.
    Positive(usize),
    /// The anchor is background for every class.
    Negative,
    /// The anchor overlaps something, but not enough to be either. Excluded from the loss.
    Ignored,
}

/// Per-anchor assignments for one image, in anchor order.
#[derive(Debug, Clone)]
pub struct Assignments {
    per_anchor: Vec<Assignment>,
    num_positive: usize,
}

impl Assignments {
    pub fn len(&self) -> usize {
        self.per_anchor.len()
    }

    pub fn is_empty(&self) -> bool {
        self.per_anchor.is_empty()
    }

    pub fn num_positive(&self) -> usize {
        self.num_positive
    }

    pub fn iter(&self) -> impl Iterator<Item = Assignment> + '_ {
        self.per_anchor.iter().copied()
    }

    /// Yields `(anchor index, ground truth index)` for every positive anchor.
    pub fn positives(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.per_anchor
            .iter()
            .enumerate()
            .filter_map(|(i, a)| match *a {
                Assignment::Positive(gt) => Some((i, gt)),
                _ => None,
            })
    }
}

impl Index<usize> for Assignments {
    type Output = Assignment;

    fn index(&self, index: usize) -> &Assignment {
        &self.per_anchor[index]
    }
}

/// Labels anchors as positive, negative or ignored by their best IoU with the ground truth.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matcher {
    positive_iou: f32,
    negative_iou: f32,
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new(Self::DEFAULT_POSITIVE_IOU, Self::DEFAULT_NEGATIVE_IOU)
    }
}

impl Matcher {
    pub const DEFAULT_POSITIVE_IOU: f32 = 0.5;
    pub const DEFAULT_NEGATIVE_IOU: f32 = 0.4;

    /// Creates a matcher.
    ///
    /// Anchors with a best IoU `>= positive_iou` become positive, those `< negative_iou` negative,
    /// everything in between is ignored.
    pub fn new(positive_iou: f32, negative_iou: f32) -> Self {
        assert!(
            negative_iou <= positive_iou,
            "negative_iou={} > positive_iou={}",
            negative_iou,
            positive_iou
        );
        Self {
            positive_iou,
            negative_iou,
        }
    }

    /// Computes the `[anchors, ground truth]` IoU matrix.
    pub fn iou_matrix(anchors: &[Rect], gt: &[Rect]) -> Array2<f32> {
        Array2::from_shape_fn((anchors.len(), gt.len()), |(a, g)| anchors[a].iou(&gt[g]))
    }

    /// Assigns every anchor.
    ///
    /// With no ground truth, every anchor is negative. On equal IoU, the lower ground truth index
    /// wins.
    pub fn assign(&self, anchors: &[Rect], gt: &[Rect]) -> Assignments {
        if gt.is_empty() {
            return Assignments {
                per_anchor: vec![Assignment::Negative; anchors.len()],
                num_positive: 0,
            };
        }

        let ious = Self::iou_matrix(anchors, gt);
        let mut num_positive = 0;
        let per_anchor = ious
            .rows()
            .into_iter()
            .map(|row| {
                let (best, best_iou) = row.iter().enumerate().fold(
                    (0, f32::NEG_INFINITY),
                    |(bi, biou), (i, &iou)| if iou > biou { (i, iou) } else { (bi, biou) },
                );

                if best_iou >= self.positive_iou {
                    num_positive += 1;
                    Assignment::Positive(best)
                } else if best_iou < self.negative_iou {
                    Assignment::Negative
                } else {
                    Assignment::Ignored
                }
            })
            .collect();

        Assignments {
            per_anchor,
            num_positive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ground_truth() {
        let anchors = [Rect::from_ltrb(0.0, 0.0, 10.0, 10.0); 5];
        let assigned = Matcher::default().assign(&anchors, &[]);
        assert_eq!(assigned.len(), 5);
        assert_eq!(assigned.num_positive(), 0);
        assert!(assigned.iter().all(|a| a == Assignment::Negative));
    }

    #[test]
    fn thresholds() {
        let gt = [Rect::from_ltrb(100.0, 100.0, 200.0, 200.0)];
        let anchors = [
            // IoU 10000 / 14400
            Rect::from_ltrb(90.0, 90.0, 210.0, 210.0),
            // IoU 0.45
            Rect::from_ltrb(100.0, 100.0, 200.0, 145.0),
            // IoU 0
            Rect::from_ltrb(300.0, 300.0, 400.0, 400.0),
            // IoU exactly 0.5
            Rect::from_ltrb(100.0, 100.0, 200.0, 150.0),
        ];
        let assigned = Matcher::default().assign(&anchors, &gt);
        assert_eq!(assigned[0], Assignment::Positive(0));
        assert_eq!(assigned[1], Assignment::Ignored);
        assert_eq!(assigned[2], Assignment::Negative);
        assert_eq!(assigned[3], Assignment::Positive(0));
        assert_eq!(assigned.num_positive(), 2);
        assert_eq!(assigned.positives().collect::<Vec<_>>(), [(0, 0), (3, 0)]);
    }

    #[test]
    fn picks_best_and_breaks_ties_by_index() {
        let anchor = Rect::from_ltrb(0.0, 0.0, 10.0, 10.0);
        let gt = [
            Rect::from_ltrb(50.0, 50.0, 60.0, 60.0),
            Rect::from_ltrb(0.0, 0.0, 10.0, 9.0),
            Rect::from_ltrb(0.0, 1.0, 10.0, 10.0),
            Rect::from_ltrb(0.0, 0.0, 10.0, 10.0),
        ];
        let assigned = Matcher::default().assign(&[anchor], &gt);
        assert_eq!(assigned[0], Assignment::Positive(3));

        let assigned = Matcher::default().assign(&[anchor], &gt[..3]);
        assert_eq!(assigned[0], Assignment::Positive(1));
    }

    #[test]
    fn iou_matrix_shape() {
        let anchors = [Rect::from_ltrb(0.0, 0.0, 1.0, 1.0); 3];
        let gt = [Rect::from_ltrb(0.0, 0.0, 1.0, 1.0); 2];
        let m = Matcher::iou_matrix(&anchors, &gt);
        assert_eq!(m.shape(), &[3, 2]);
        assert!(m.iter().all(|&v| v == 1.0));
    }
}
