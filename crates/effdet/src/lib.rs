//! EfficientDet single-stage object detector core.
//!
//! This crate contains everything around the network: multi-scale anchor generation, the box
//! coder, IoU-based anchor assignment, focal loss, and decoding with per-class non-maximum
//! suppression. The backbone, feature pyramid and prediction heads are plugged in through the
//! [`Network`] trait.
//!
//! # Coordinates
//!
//! Boxes are [`Rect`]s in pixel coordinates of the square canvas the network runs at, unless noted
//! otherwise. X points right and Y points down. Regression deltas are `(x, y, w, h)`, see [`head`]
//! for how legacy `(y, x, h, w)` head outputs are handled.
//!
//! # Environment Variables
//!
//! * `RUST_LOG`: overrides the log levels set by [`init_logger!`].
//!
//! [`Rect`]: effdet_geom::Rect

use log::LevelFilter;

pub mod assign;
pub mod coder;
pub mod config;
pub mod detection;
pub mod detector;
pub mod head;
pub mod loss;
pub mod preprocess;
pub mod target;
pub mod timer;

pub use config::{DetectorConfig, ModelVariant, ScoreActivation};
pub use detection::{Detection, ImageDetections};
pub use detector::{EfficientDet, ForwardOptions, Network, Output};
pub use effdet_geom::Rect;
pub use head::{Deltas, HeadOutputs};
pub use loss::Losses;
pub use target::Target;

/// macro-use only, not part of public API.
#[doc(hidden)]
pub fn init_logger(calling_crate: &'static str) {
    let log_level = if cfg!(debug_assertions) {
        LevelFilter::Trace
    } else {
        LevelFilter::Debug
    };
    env_logger::Builder::new()
        .filter(Some(calling_crate), log_level)
        .filter(Some(env!("CARGO_PKG_NAME")), log_level)
        .parse_default_env()
        .try_init()
        .ok();
}

/// Initializes logging to *stderr*.
///
/// If `cfg!(debug_assertions)` is enabled, the calling crate and this crate will log at *trace*
/// level. Otherwise, they will log at *debug* level.
///
/// If a global logger is already registered, this macro will do nothing.
#[macro_export]
macro_rules! init_logger {
    () => {
        $crate::init_logger(env!("CARGO_CRATE_NAME"))
    };
}
