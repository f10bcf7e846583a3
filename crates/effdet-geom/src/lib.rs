//! Box geometry for single-stage object detection.
//!
//! # Box Conventions
//!
//! Detection code juggles two representations of the same four numbers: corner form
//! `(left, top, right, bottom)`, used for ground truth and final detections, and center form
//! `(center_x, center_y, width, height)`, used when encoding regression targets. Mixing them up
//! silently produces garbage, so this crate never hands out a bare `[f32; 4]` without saying
//! which form it is in. A [`Rect`] is constructed with [`Rect::from_ltrb`] or
//! [`Rect::from_center`] and read back with [`Rect::ltrb`] or [`Rect::center`]/[`Rect::size`].
//!
//! All coordinates are in pixels of whatever space the caller works in (canvas or original
//! image). Y points down.

pub mod num;
pub mod rect;

pub use rect::Rect;
