//! Training loss: focal loss for classification, smooth-L1 for box regression.
//!
//! Per image, anchors are assigned by [`Matcher`]. Positive anchors are trained towards 1 on their
//! matched class and 0 on all others, negative anchors towards 0 on every class, and ignored
//! anchors do not contribute at all. Only positive anchors contribute to the regression loss.
//!
//! Both terms are summed over the batch and divided by the number of positive anchors in the
//! batch (at least 1), which keeps them independent of the batch size.

use std::collections::BTreeMap;

use effdet_geom::Rect;
use ndarray::{ArrayView2, ArrayView3, Axis};
use rayon::prelude::*;

use crate::{
    assign::{Assignment, Matcher},
    coder::BoxCoder,
    config::ScoreActivation,
    head::Deltas,
    target::Target,
};

/// The two scalar loss terms of a batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Losses {
    pub classification: f32,
    pub regression: f32,
    /// Number of positive anchors in the batch.
    pub num_positive: usize,
}

impl Losses {
    pub fn total(&self) -> f32 {
        self.classification + self.regression
    }

    /// Returns the losses keyed as `classification_loss` and `regression_loss`.
    pub fn as_map(&self) -> BTreeMap<&'static str, f32> {
        BTreeMap::from([
            ("classification_loss", self.classification),
            ("regression_loss", self.regression),
        ])
    }
}

/// Unnormalized loss sums of one image.
#[derive(Debug, Default)]
struct ImageLoss {
    classification: f64,
    regression: f64,
    num_positive: usize,
}

/// Focal loss with smooth-L1 box regression.
#[derive(Debug, Clone)]
pub struct FocalLoss {
    alpha: f32,
    gamma: f32,
    divide_line: f32,
    matcher: Matcher,
    coder: BoxCoder,
    activation: ScoreActivation,
}

impl FocalLoss {
    /// Creates the loss.
    ///
    /// - `alpha`: weight of the positive class, `1 - alpha` weighs the negative class.
    /// - `gamma`: focusing exponent of the `(1 - p_t)^gamma` modulation.
    /// - `divide_line`: probabilities are kept at least this far from 0 and 1 inside the
    ///   logarithm, and the smooth-L1 regression loss switches from quadratic to linear at this
    ///   absolute error.
    pub fn new(alpha: f32, gamma: f32, divide_line: f32) -> Self {
        assert!(
            divide_line > 0.0 && divide_line < 0.5,
            "divide_line must lie in (0, 0.5), got {}",
            divide_line
        );
        Self {
            alpha,
            gamma,
            divide_line,
            matcher: Matcher::default(),
            coder: BoxCoder::new(),
            activation: ScoreActivation::Sigmoid,
        }
    }

    pub fn set_matcher(&mut self, matcher: Matcher) {
        self.matcher = matcher;
    }

    /// Sets how raw classification outputs are turned into probabilities. Defaults to sigmoid.
    pub fn set_activation(&mut self, activation: ScoreActivation) {
        self.activation = activation;
    }

    /// Focal loss of one anchor/class cell with probability `p` and target `positive`.
    pub fn focal_term(&self, p: f32, positive: bool) -> f32 {
        let p = p.clamp(0.0, 1.0);
        let (p_t, alpha_t) = if positive {
            (p, self.alpha)
        } else {
            (1.0 - p, 1.0 - self.alpha)
        };
        let log_p_t = p_t.clamp(self.divide_line, 1.0 - self.divide_line).ln();
        -alpha_t * (1.0 - p_t).powf(self.gamma) * log_p_t
    }

    /// Smooth-L1 loss of a single regression error.
    pub fn smooth_l1(&self, diff: f32) -> f32 {
        let diff = diff.abs();
        if diff < self.divide_line {
            0.5 * diff * diff / self.divide_line
        } else {
            diff - 0.5 * self.divide_line
        }
    }

    /// Computes the batch losses.
    ///
    /// - `classifications`: `[batch, anchors, classes]` raw classification outputs.
    /// - `regressions`: `[batch, anchors, 4]` deltas.
    /// - `anchors`: the anchors of the canvas, in head output order.
    /// - `targets`: one [`Target`] per image, in canvas coordinates.
    ///
    /// # Panics
    ///
    /// Panics if the batch sizes or anchor counts of the inputs disagree, or if a target label is
    /// not a valid class index.
    pub fn compute(
        &self,
        classifications: ArrayView3<'_, f32>,
        regressions: &Deltas,
        anchors: &[Rect],
        targets: &[Target],
    ) -> Losses {
        let batch = targets.len();
        assert_eq!(
            classifications.shape()[0],
            batch,
            "classification batch size does not match the number of targets"
        );
        assert_eq!(
            regressions.batch_size(),
            batch,
            "regression batch size does not match the number of targets"
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

        let per_image = (0..batch)
            .into_par_iter()
            .map(|i| {
                self.image_loss(
                    classifications.index_axis(Axis(0), i),
                    regressions.image(i),
                    anchors,
                    &targets[i],
                )
            })
            .collect::<Vec<_>>();

        let mut sum = ImageLoss::default();
        for image in &per_image {
            sum.classification += image.classification;
            sum.regression += image.regression;
            sum.num_positive += image.num_positive;
        }

        let norm = sum.num_positive.max(1) as f64;
        let losses = Losses {
            classification: (sum.classification / norm) as f32,
            regression: (sum.regression / norm) as f32,
            num_positive: sum.num_positive,
        };
        log::debug!(
            "loss over {} images: {} positive anchors, classification={:.5}, regression={:.5}",
            batch,
            losses.num_positive,
            losses.classification,
            losses.regression
        );
        losses
    }

    fn image_loss(
        &self,
        classifications: ArrayView2<'_, f32>,
        regressions: ArrayView2<'_, f32>,
        anchors: &[Rect],
        target: &Target,
    ) -> ImageLoss {
        let num_classes = classifications.ncols();
        for &label in target.labels() {
            assert!(
                (label as usize) < num_classes,
                "target label {} out of range for {} classes",
                label,
                num_classes
            );
        }

        let assigned = self.matcher.assign(anchors, target.boxes());
        let mut loss = ImageLoss {
            num_positive: assigned.num_positive(),
            ..ImageLoss::default()
        };

        for (index, assignment) in assigned.iter().enumerate() {
            let row = classifications.row(index);
            let label = match assignment {
                Assignment::Ignored => continue,
                Assignment::Negative => None,
                Assignment::Positive(gt) => Some((gt, target.labels()[gt] as usize)),
            };

            let class_loss: f32 = row
                .iter()
                .enumerate()
                .map(|(class, &raw)| {
                    let positive = label.map_or(false, |(_, l)| l == class);
                    self.focal_term(self.activation.apply(raw), positive)
                })
                .sum();
            loss.classification += f64::from(class_loss);

            if let Some((gt, _)) = label {
                let wanted = self.coder.encode(&anchors[index], &target.boxes()[gt]);
                let predicted = regressions.row(index);
                let reg_loss: f32 = predicted
                    .iter()
                    .zip(wanted)
                    .map(|(&p, w)| self.smooth_l1(p - w))
                    .sum();
                loss.regression += f64::from(reg_loss) / 4.0;
            }
        }

        log::trace!(
            "image with {} objects: {} positive anchors",
            target.len(),
            loss.num_positive
        );
        loss
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::Array3;

    use super::*;

    fn loss() -> FocalLoss {
        let mut loss = FocalLoss::new(0.25, 2.0, 1.0 / 9.0);
        loss.set_activation(ScoreActivation::Identity);
        loss
    }

    #[test]
    fn focal_term_values() {
        let loss = loss();
        // p_t = 0.5 lies inside the clamp range, so this is the plain formula.
        assert_abs_diff_eq!(
            loss.focal_term(0.5, true),
            -0.25 * 0.25 * 0.5f32.ln(),
            epsilon = 1e-6
        );
        assert_abs_diff_eq!(
            loss.focal_term(0.5, false),
            -0.75 * 0.25 * 0.5f32.ln(),
            epsilon = 1e-6
        );
        // Confidently right goes to 0, confidently wrong stays bounded.
        assert_eq!(loss.focal_term(1.0, true), 0.0);
        assert_eq!(loss.focal_term(0.0, false), 0.0);
        let wrong = loss.focal_term(0.0, true);
        assert!(wrong.is_finite());
        assert_abs_diff_eq!(wrong, -0.25 * (1.0f32 / 9.0).ln(), epsilon = 1e-6);
        // Easy examples are down-weighted.
        assert!(loss.focal_term(0.9, true) < loss.focal_term(0.6, true));
    }

    #[test]
    fn smooth_l1_is_continuous() {
        let loss = loss();
        let beta = 1.0 / 9.0;
        assert_eq!(loss.smooth_l1(0.0), 0.0);
        assert_abs_diff_eq!(loss.smooth_l1(beta - 1e-6), loss.smooth_l1(beta), epsilon = 1e-5);
        assert_abs_diff_eq!(loss.smooth_l1(-2.0), 2.0 - 0.5 * beta, epsilon = 1e-6);
    }

    #[test]
    fn no_ground_truth() {
        let anchors = [
            Rect::from_ltrb(0.0, 0.0, 10.0, 10.0),
            Rect::from_ltrb(10.0, 10.0, 20.0, 20.0),
        ];
        let cls = Array3::from_elem((1, 2, 3), 0.5);
        let reg = Deltas::from_xywh(Array3::from_elem((1, 2, 4), 3.0));
        let losses = loss().compute(cls.view(), &reg, &anchors, &[Target::empty()]);

        assert_eq!(losses.regression, 0.0);
        assert_eq!(losses.num_positive, 0);
        assert!(losses.classification.is_finite());
        // 6 negative cells, divided by max(0, 1).
        assert_abs_diff_eq!(
            losses.classification,
            6.0 * loss().focal_term(0.5, false),
            epsilon = 1e-5
        );
    }

    #[test]
    fn extreme_logits_stay_finite() {
        let mut loss = loss();
        loss.set_activation(ScoreActivation::Sigmoid);
        let anchors = [Rect::from_ltrb(0.0, 0.0, 10.0, 10.0)];
        let target = Target::new(vec![0], vec![Rect::from_ltrb(0.0, 0.0, 10.0, 10.0)]);
        for raw in [-1e30, -100.0, 100.0, 1e30] {
            let cls = Array3::from_elem((1, 1, 2), raw);
            let reg = Deltas::from_xywh(Array3::from_elem((1, 1, 4), 1e6));
            let losses = loss.compute(cls.view(), &reg, &anchors, &[target.clone()]);
            assert!(losses.classification.is_finite(), "{raw}");
            assert!(losses.regression.is_finite(), "{raw}");
        }
    }

    #[test]
    fn ignored_anchors_do_not_contribute() {
        let gt = Rect::from_ltrb(100.0, 100.0, 200.0, 200.0);
        let anchors = [
            // positive
            Rect::from_ltrb(90.0, 90.0, 210.0, 210.0),
            // ignored (IoU 0.45)
            Rect::from_ltrb(100.0, 100.0, 200.0, 145.0),
        ];
        let coder = BoxCoder::new();
        let perfect = coder.encode(&anchors[0], &gt);

        let mut cls = Array3::from_elem((1, 2, 4), 0.9);
        cls[[0, 0, 0]] = 0.1;
        cls[[0, 0, 1]] = 0.1;
        cls[[0, 0, 2]] = 0.1;
        cls[[0, 0, 3]] = 0.9;
        let mut reg = Array3::from_elem((1, 2, 4), 100.0);
        for (k, v) in perfect.into_iter().enumerate() {
            reg[[0, 0, k]] = v;
        }
        let losses = loss().compute(
            cls.view(),
            &Deltas::from_xywh(reg),
            &anchors,
            &[Target::new(vec![3], vec![gt])],
        );

        assert_eq!(losses.num_positive, 1);
        assert_abs_diff_eq!(losses.regression, 0.0, epsilon = 1e-6);
        let expected = 3.0 * loss().focal_term(0.1, false) + loss().focal_term(0.9, true);
        assert_abs_diff_eq!(losses.classification, expected, epsilon = 1e-6);
    }

    #[test]
    fn normalized_by_batch_positives() {
        let gt = Rect::from_ltrb(100.0, 100.0, 200.0, 200.0);
        let anchors = [Rect::from_ltrb(90.0, 90.0, 210.0, 210.0)];
        let target = Target::new(vec![0], vec![gt]);

        let cls = Array3::from_elem((1, 1, 2), 0.3);
        let reg = Deltas::from_xywh(Array3::from_elem((1, 1, 4), 0.5));
        let single = loss().compute(cls.view(), &reg, &anchors, &[target.clone()]);

        let cls2 = Array3::from_elem((2, 1, 2), 0.3);
        let reg2 = Deltas::from_xywh(Array3::from_elem((2, 1, 4), 0.5));
        let double = loss().compute(
            cls2.view(),
            &reg2,
            &anchors,
            &[target.clone(), target.clone()],
        );

        assert_eq!(double.num_positive, 2);
        assert_abs_diff_eq!(single.classification, double.classification, epsilon = 1e-6);
        assert_abs_diff_eq!(single.regression, double.regression, epsilon = 1e-6);

        // An extra image without objects adds background loss, but does not dilute regression.
        let reg3 = Deltas::from_xywh(Array3::from_elem((2, 1, 4), 0.5));
        let mixed = loss().compute(
            cls2.view(),
            &reg3,
            &anchors,
            &[target, Target::empty()],
        );
        assert_eq!(mixed.num_positive, 1);
        assert_abs_diff_eq!(mixed.regression, single.regression, epsilon = 1e-6);
        assert!(mixed.classification > single.classification);
    }

    #[test]
    #[should_panic(expected = "anchors, expected")]
    fn rejects_anchor_mismatch() {
        let anchors = [Rect::from_ltrb(0.0, 0.0, 1.0, 1.0)];
        let cls = Array3::from_elem((1, 2, 2), 0.3);
        let reg = Deltas::from_xywh(Array3::from_elem((1, 2, 4), 0.0));
        loss().compute(cls.view(), &reg, &anchors, &[Target::empty()]);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn rejects_bad_label() {
        let anchors = [Rect::from_ltrb(0.0, 0.0, 1.0, 1.0)];
        let cls = Array3::from_elem((1, 1, 2), 0.3);
        let reg = Deltas::from_xywh(Array3::from_elem((1, 1, 4), 0.0));
        let target = Target::new(vec![2], vec![Rect::from_ltrb(0.0, 0.0, 1.0, 1.0)]);
        loss().compute(cls.view(), &reg, &anchors, &[target]);
    }

    #[test]
    fn named_terms() {
        let losses = Losses {
            classification: 1.5,
            regression: 0.25,
            num_positive: 3,
        };
        let map = losses.as_map();
        assert_eq!(map["classification_loss"], 1.5);
        assert_eq!(map["regression_loss"], 0.25);
        assert_eq!(losses.total(), 1.75);
    }
}
