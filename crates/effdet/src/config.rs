//! Detector configuration and the model variant table.
//!
//! Different model sizes are not different code paths, only different [`DetectorConfig`] values
//! feeding the same pipeline. [`ModelVariant`] lists the published sizes, and [`WeightsTable`]
//! maps them to pretrained weights without any process-wide registry.

use std::{collections::HashMap, fmt, str::FromStr};

use anyhow::{bail, ensure};

use crate::{
    assign::Matcher,
    detection::{anchor::AnchorParams, postprocess::PostProcess},
    loss::FocalLoss,
};

/// Largest canvas the detector will run at.
pub const MAX_CANVAS_SIZE: u32 = 1920;

/// Canvas sizes must be a multiple of this (the stride of the coarsest pyramid level).
pub const CANVAS_MULTIPLE: u32 = 128;

/// Rounds `requested` down to a multiple of [`CANVAS_MULTIPLE`] and caps it at
/// [`MAX_CANVAS_SIZE`].
///
/// Out-of-range requests are corrected silently. A request too small to round to a non-zero
/// canvas is an error.
pub fn normalize_canvas_size(requested: u32) -> anyhow::Result<u32> {
    let size = (requested / CANVAS_MULTIPLE * CANVAS_MULTIPLE).min(MAX_CANVAS_SIZE);
    if size == 0 {
        bail!(
            "canvas size {} is smaller than the minimum of {}",
            requested,
            CANVAS_MULTIPLE
        );
    }
    if size != requested {
        log::debug!("canvas size {} corrected to {}", requested, size);
    }
    Ok(size)
}

/// Supported pyramid levels. Level `l` has stride `2^l`, and strides beyond 1024 exceed any canvas.
pub const PYRAMID_LEVELS: std::ops::RangeInclusive<u32> = 1..=10;

/// How raw classification outputs are turned into per-class probabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreActivation {
    /// Outputs are logits; the sigmoid is applied per anchor and class.
    Sigmoid,
    /// Outputs already are probabilities in `[0, 1]`.
    Identity,
}

impl ScoreActivation {
    #[inline]
    pub fn apply(self, raw: f32) -> f32 {
        match self {
            ScoreActivation::Sigmoid => effdet_geom::num::sigmoid(raw),
            ScoreActivation::Identity => raw,
        }
    }
}

/// All recognized detector options.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Number of object classes the classification head distinguishes.
    pub num_classes: usize,
    /// Canvas size used when the caller does not pass one.
    pub image_size: u32,
    /// Ratio of anchor extent to pyramid stride.
    pub anchor_base_scale: f32,
    pub anchor_scales: Vec<f32>,
    /// `(height, width)` multipliers.
    pub anchor_aspect_ratios: Vec<(f32, f32)>,
    /// Pyramid levels as exponents of 2 (level `l` has stride `2^l`).
    pub pyramid_levels: Vec<u32>,
    pub positive_iou: f32,
    pub negative_iou: f32,
    pub alpha: f32,
    pub gamma: f32,
    pub divide_line: f32,
    pub score_thresh: f32,
    pub nms_thresh: f32,
    pub score_activation: ScoreActivation,
    /// Per-channel normalization applied by preprocessing.
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            num_classes: 90,
            image_size: 512,
            anchor_base_scale: 4.0,
            anchor_scales: vec![1.0, 2f32.powf(1.0 / 3.0), 2f32.powf(2.0 / 3.0)],
            anchor_aspect_ratios: vec![(1.0, 1.0), (0.7, 1.4), (1.4, 0.7)],
            pyramid_levels: vec![3, 4, 5, 6, 7],
            positive_iou: 0.5,
            negative_iou: 0.4,
            alpha: 0.25,
            gamma: 2.0,
            divide_line: 1.0 / 9.0,
            score_thresh: 0.5,
            nms_thresh: 0.5,
            score_activation: ScoreActivation::Sigmoid,
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
        }
    }
}

impl DetectorConfig {
    /// Creates the default configuration for a model variant.
    pub fn for_variant(variant: ModelVariant) -> Self {
        let v = variant.config();
        Self {
            image_size: v.image_size,
            anchor_base_scale: v.anchor_base_scale,
            ..Self::default()
        }
    }

    /// Number of anchors generated per feature map cell.
    pub fn num_anchor_variants(&self) -> usize {
        self.anchor_scales.len() * self.anchor_aspect_ratios.len()
    }

    /// Checks the configuration for values the pipeline cannot work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.num_classes > 0, "class set must not be empty");
        ensure!(
            !self.anchor_scales.is_empty() && !self.anchor_aspect_ratios.is_empty(),
            "anchor scales and aspect ratios must not be empty"
        );
        ensure!(
            !self.pyramid_levels.is_empty(),
            "at least one pyramid level is required"
        );
        ensure!(
            self.anchor_base_scale > 0.0
                && self.anchor_scales.iter().all(|&s| s > 0.0)
                && self
                    .anchor_aspect_ratios
                    .iter()
                    .all(|&(h, w)| h > 0.0 && w > 0.0),
            "anchor base scale, scales and aspect ratios must be positive"
        );
        if let Some(&level) = self
            .pyramid_levels
            .iter()
            .find(|&&l| !PYRAMID_LEVELS.contains(&l))
        {
            bail!(
                "pyramid level {} outside of {:?}",
                level,
                PYRAMID_LEVELS
            );
        }
        ensure!(
            self.positive_iou > 0.0 && self.positive_iou <= 1.0,
            "positive IoU threshold must lie in (0, 1], got {}",
            self.positive_iou
        );
        ensure!(
            self.negative_iou <= self.positive_iou,
            "negative IoU threshold {} exceeds positive threshold {}",
            self.negative_iou,
            self.positive_iou
        );
        ensure!(
            self.divide_line > 0.0 && self.divide_line < 0.5,
            "divide_line must lie in (0, 0.5), got {}",
            self.divide_line
        );
        ensure!(
            (0.0..=1.0).contains(&self.alpha) && self.gamma >= 0.0,
            "invalid focal loss parameters alpha={} gamma={}",
            self.alpha,
            self.gamma
        );
        ensure!(
            self.std.iter().all(|&s| s > 0.0),
            "normalization std must be positive"
        );
        normalize_canvas_size(self.image_size)?;
        Ok(())
    }

    pub fn anchor_params(&self) -> AnchorParams {
        AnchorParams {
            base_scale: self.anchor_base_scale,
            scales: self.anchor_scales.clone(),
            aspect_ratios: self.anchor_aspect_ratios.clone(),
            pyramid_levels: self.pyramid_levels.clone(),
        }
    }

    pub fn matcher(&self) -> Matcher {
        Matcher::new(self.positive_iou, self.negative_iou)
    }

    pub fn focal_loss(&self) -> FocalLoss {
        let mut loss = FocalLoss::new(self.alpha, self.gamma, self.divide_line);
        loss.set_matcher(self.matcher());
        loss.set_activation(self.score_activation);
        loss
    }

    /// Creates the post-processing stage, falling back to the configured thresholds.
    pub fn post_process(&self, score_thresh: Option<f32>, nms_thresh: Option<f32>) -> PostProcess {
        let mut post = PostProcess::new(
            score_thresh.unwrap_or(self.score_thresh),
            nms_thresh.unwrap_or(self.nms_thresh),
        );
        post.set_activation(self.score_activation);
        post
    }
}

/// The published model sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModelVariant {
    D0,
    D1,
    D2,
    D3,
    D4,
    D5,
    D6,
    D7,
}

/// Architecture parameters of a [`ModelVariant`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VariantConfig {
    /// Default canvas size (a multiple of 128).
    pub image_size: u32,
    pub backbone: &'static str,
    pub fpn_channels: u32,
    pub fpn_num_repeat: u32,
    pub head_num_repeat: u32,
    pub anchor_base_scale: f32,
}

impl ModelVariant {
    pub const ALL: [ModelVariant; 8] = [
        ModelVariant::D0,
        ModelVariant::D1,
        ModelVariant::D2,
        ModelVariant::D3,
        ModelVariant::D4,
        ModelVariant::D5,
        ModelVariant::D6,
        ModelVariant::D7,
    ];

    pub fn config(self) -> VariantConfig {
        let (image_size, backbone, fpn_channels, fpn_num_repeat, head_num_repeat, base) =
            match self {
                ModelVariant::D0 => (512, "efficientnet_b0", 64, 3, 3, 4.0),
                ModelVariant::D1 => (640, "efficientnet_b1", 88, 4, 3, 4.0),
                ModelVariant::D2 => (768, "efficientnet_b2", 112, 5, 3, 4.0),
                ModelVariant::D3 => (896, "efficientnet_b3", 160, 6, 4, 4.0),
                ModelVariant::D4 => (1024, "efficientnet_b4", 224, 7, 4, 4.0),
                ModelVariant::D5 => (1280, "efficientnet_b5", 288, 7, 4, 4.0),
                ModelVariant::D6 => (1280, "efficientnet_b6", 384, 8, 5, 4.0),
                ModelVariant::D7 => (1536, "efficientnet_b6", 384, 8, 5, 5.0),
            };
        VariantConfig {
            image_size,
            backbone,
            fpn_channels,
            fpn_num_repeat,
            head_num_repeat,
            anchor_base_scale: base,
        }
    }

    /// The canonical model name, eg. `efficientdet_d0`.
    pub fn name(self) -> &'static str {
        match self {
            ModelVariant::D0 => "efficientdet_d0",
            ModelVariant::D1 => "efficientdet_d1",
            ModelVariant::D2 => "efficientdet_d2",
            ModelVariant::D3 => "efficientdet_d3",
            ModelVariant::D4 => "efficientdet_d4",
            ModelVariant::D5 => "efficientdet_d5",
            ModelVariant::D6 => "efficientdet_d6",
            ModelVariant::D7 => "efficientdet_d7",
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelVariant {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match Self::ALL.into_iter().find(|v| v.name() == s) {
            Some(v) => Ok(v),
            None => bail!("unknown model variant '{}'", s),
        }
    }
}

/// Maps model variants to the location of their pretrained weights.
///
/// Fetching and loading the weights is left to the caller.
#[derive(Debug, Clone, Default)]
pub struct WeightsTable {
    urls: HashMap<ModelVariant, String>,
}

impl WeightsTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The upstream release weights for all variants.
    pub fn official() -> Self {
        let mut table = Self::new();
        for variant in ModelVariant::ALL {
            table.insert(
                variant,
                format!(
                    "https://github.com/Jintao-Huang/EfficientDet_PyTorch/releases/download/1.0/{}.pth",
                    variant.name().replace('_', "-")
                ),
            );
        }
        table
    }

    pub fn insert(&mut self, variant: ModelVariant, url: impl Into<String>) {
        self.urls.insert(variant, url.into());
    }

    pub fn url(&self, variant: ModelVariant) -> Option<&str> {
        self.urls.get(&variant).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canvas_size_rounding() {
        assert_eq!(normalize_canvas_size(512).unwrap(), 512);
        assert_eq!(normalize_canvas_size(600).unwrap(), 512);
        assert_eq!(normalize_canvas_size(4000).unwrap(), 1920);
        assert_eq!(normalize_canvas_size(128).unwrap(), 128);
        assert!(normalize_canvas_size(127).is_err());
        assert!(normalize_canvas_size(0).is_err());
    }

    #[test]
    fn variant_names_round_trip() {
        for variant in ModelVariant::ALL {
            assert_eq!(variant.name().parse::<ModelVariant>().unwrap(), variant);
            let size = variant.config().image_size;
            assert_eq!(size % CANVAS_MULTIPLE, 0, "{variant}");
        }
        assert!("efficientdet_d8".parse::<ModelVariant>().is_err());
        assert_eq!(ModelVariant::D7.config().anchor_base_scale, 5.0);
    }

    #[test]
    fn official_weights() {
        let table = WeightsTable::official();
        assert_eq!(
            table.url(ModelVariant::D3),
            Some("https://github.com/Jintao-Huang/EfficientDet_PyTorch/releases/download/1.0/efficientdet-d3.pth")
        );
        assert_eq!(WeightsTable::new().url(ModelVariant::D0), None);
    }

    #[test]
    fn validation() {
        DetectorConfig::default().validate().unwrap();
        DetectorConfig::for_variant(ModelVariant::D6)
            .validate()
            .unwrap();

        let mut config = DetectorConfig::default();
        config.num_classes = 0;
        assert!(config.validate().is_err());

        let mut config = DetectorConfig::default();
        config.anchor_scales.clear();
        assert!(config.validate().is_err());

        let mut config = DetectorConfig::default();
        config.negative_iou = 0.6;
        assert!(config.validate().is_err());

        let mut config = DetectorConfig::default();
        config.pyramid_levels = vec![3, 40];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("pyramid level 40"), "{err}");

        let mut config = DetectorConfig::default();
        config.pyramid_levels = vec![0, 3];
        assert!(config.validate().is_err());

        let mut config = DetectorConfig::default();
        config.pyramid_levels = vec![10];
        config.validate().unwrap();

        let mut config = DetectorConfig::default();
        config.positive_iou = 0.0;
        config.negative_iou = 0.0;
        assert!(config.validate().is_err());

        let mut config = DetectorConfig::default();
        config.positive_iou = 1.5;
        assert!(config.validate().is_err());

        let config = DetectorConfig::default();
        assert_eq!(config.num_anchor_variants(), 9);
    }
}
