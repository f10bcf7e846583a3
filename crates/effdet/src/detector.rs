//! The detector facade: preprocessing, network, and either the loss or post-processing.

use std::sync::Arc;

use anyhow::ensure;
use ndarray::{Array3, Array4};

use crate::{
    config::{normalize_canvas_size, DetectorConfig},
    detection::{
        anchor::{AnchorGenerator, Anchors},
        ImageDetections,
    },
    head::HeadOutputs,
    loss::{FocalLoss, Losses},
    preprocess::PreProcess,
    target::Target,
    timer::Timer,
};

/// The backbone, feature pyramid and prediction heads.
///
/// The detector is agnostic to how these are implemented. The only requirement is that the heads
/// produce outputs for exactly the anchors [`Anchors::calculate`] generates for the canvas, in the
/// same order.
pub trait Network: Send + Sync {
    /// Runs the network on a normalized `[batch, 3, canvas, canvas]` batch.
    fn forward(&self, batch: &Array4<f32>) -> anyhow::Result<HeadOutputs>;
}

impl<N: Network + ?Sized> Network for Box<N> {
    fn forward(&self, batch: &Array4<f32>) -> anyhow::Result<HeadOutputs> {
        (**self).forward(batch)
    }
}

/// Per-call options of [`EfficientDet::forward`]. `None` falls back to the configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ForwardOptions {
    /// Requested canvas size. Rounded down to a multiple of 128 and capped at 1920.
    pub image_size: Option<u32>,
    /// Only used at inference.
    pub score_thresh: Option<f32>,
    /// Only used at inference.
    pub nms_thresh: Option<f32>,
}

/// Result of [`EfficientDet::forward`].
#[derive(Debug, Clone)]
pub enum Output {
    /// Returned when targets were given.
    Losses(Losses),
    /// Returned without targets, one entry per input image.
    Detections(Vec<ImageDetections>),
}

impl Output {
    pub fn into_losses(self) -> Option<Losses> {
        match self {
            Output::Losses(losses) => Some(losses),
            Output::Detections(_) => None,
        }
    }

    pub fn into_detections(self) -> Option<Vec<ImageDetections>> {
        match self {
            Output::Detections(dets) => Some(dets),
            Output::Losses(_) => None,
        }
    }
}

/// A single-stage EfficientDet detector.
pub struct EfficientDet<N> {
    network: N,
    config: DetectorConfig,
    anchors: AnchorGenerator,
    preprocess: PreProcess,
    loss: FocalLoss,
    t_preprocess: Timer,
    t_network: Timer,
    t_loss: Timer,
    t_postprocess: Timer,
}

impl<N: Network> EfficientDet<N> {
    /// Creates a detector running `network`.
    ///
    /// Fails if `config` is invalid.
    pub fn new(network: N, config: DetectorConfig) -> anyhow::Result<Self> {
        config.validate()?;
        log::debug!(
            "creating detector: {} classes, {} anchors per cell, canvas {}",
            config.num_classes,
            config.num_anchor_variants(),
            config.image_size
        );
        Ok(Self {
            network,
            anchors: AnchorGenerator::new(config.anchor_params()),
            preprocess: PreProcess::new(config.mean, config.std),
            loss: config.focal_loss(),
            config,
            t_preprocess: Timer::new("preprocess"),
            t_network: Timer::new("network"),
            t_loss: Timer::new("loss"),
            t_postprocess: Timer::new("postprocess"),
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    /// Returns the (cached) anchors of a canvas.
    pub fn anchors(&self, canvas_size: u32) -> Arc<Anchors> {
        self.anchors.anchors(canvas_size)
    }

    /// Runs the detector on a batch of `[3, height, width]` images with values in `[0, 1]`.
    ///
    /// With `targets` (one per image, in original image coordinates), returns the training
    /// [`Losses`]. Without, returns the detections of every image in original image coordinates.
    pub fn forward(
        &self,
        images: &[Array3<f32>],
        targets: Option<&[Target]>,
        options: ForwardOptions,
    ) -> anyhow::Result<Output> {
        ensure!(!images.is_empty(), "empty image batch");
        for (i, image) in images.iter().enumerate() {
            let (channels, height, width) = image.dim();
            ensure!(
                channels == 3,
                "image {} has {} channels, expected 3",
                i,
                channels
            );
            ensure!(height > 0 && width > 0, "image {} is empty", i);
        }
        if let Some(targets) = targets {
            ensure!(
                targets.len() == images.len(),
                "got {} targets for {} images",
                targets.len(),
                images.len()
            );
            for (i, target) in targets.iter().enumerate() {
                if let Some(&label) = target
                    .labels()
                    .iter()
                    .find(|&&l| l as usize >= self.config.num_classes)
                {
                    anyhow::bail!(
                        "target {} has label {}, but there are only {} classes",
                        i,
                        label,
                        self.config.num_classes
                    );
                }
            }

            if options.score_thresh.is_some() || options.nms_thresh.is_some() {
                log::warn!("score and NMS thresholds are ignored when computing losses");
            }
        }

        let canvas = normalize_canvas_size(options.image_size.unwrap_or(self.config.image_size))?;
        let batch = self
            .t_preprocess
            .time(|| self.preprocess.process(images, targets, canvas));

        let outputs = self.t_network.time(|| self.network.forward(&batch.images))?;
        let anchors = self.anchors(canvas);
        self.check_outputs(&outputs, images.len(), &anchors)?;
        let (classifications, deltas) = outputs.into_parts();

        let output = match &batch.targets {
            Some(targets) => Output::Losses(self.t_loss.time(|| {
                self.loss.compute(
                    classifications.view(),
                    &deltas,
                    anchors.as_slice(),
                    targets,
                )
            })),
            None => {
                let post = self
                    .config
                    .post_process(options.score_thresh, options.nms_thresh);
                Output::Detections(self.t_postprocess.time(|| {
                    post.process(
                        classifications.view(),
                        &deltas,
                        anchors.as_slice(),
                        &batch.metas,
                    )
                }))
            }
        };
        Ok(output)
    }

    fn check_outputs(
        &self,
        outputs: &HeadOutputs,
        batch: usize,
        anchors: &Anchors,
    ) -> anyhow::Result<()> {
        let expected_cls = [batch, anchors.anchor_count(), self.config.num_classes];
        ensure!(
            outputs.classifications.shape() == expected_cls,
            "classification output has shape {:?}, expected {:?}",
            outputs.classifications.shape(),
            expected_cls
        );
        let expected_reg = [batch, anchors.anchor_count(), 4];
        ensure!(
            outputs.regressions.shape() == expected_reg,
            "regression output has shape {:?}, expected {:?}",
            outputs.regressions.shape(),
            expected_reg
        );
        Ok(())
    }

    /// Returns profiling timers for the pipeline stages.
    pub fn timers(&self) -> impl Iterator<Item = &Timer> + '_ {
        [
            &self.t_preprocess,
            &self.t_network,
            &self.t_loss,
            &self.t_postprocess,
        ]
        .into_iter()
    }
}
