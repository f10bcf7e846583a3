//! Input normalization and letterboxing onto the square canvas.

use effdet_geom::Rect;
use ndarray::{s, Array2, Array3, Array4, ArrayView2};
use rayon::prelude::*;

use crate::target::Target;

/// Describes how an input image was placed on the canvas.
///
/// The image is scaled uniformly so its longer side spans the canvas, placed at the canvas origin
/// (plus `offset`) and the remainder is zero-padded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CanvasMeta {
    canvas_size: u32,
    original_width: u32,
    original_height: u32,
    scale: f32,
    offset: (f32, f32),
}

impl CanvasMeta {
    /// Computes the placement of a `width x height` image on a `canvas_size` canvas.
    pub fn new(canvas_size: u32, original_width: u32, original_height: u32) -> Self {
        assert!(
            original_width > 0 && original_height > 0,
            "cannot place a {}x{} image",
            original_width,
            original_height
        );
        let scale = canvas_size as f32 / original_width.max(original_height) as f32;
        Self {
            canvas_size,
            original_width,
            original_height,
            scale,
            offset: (0.0, 0.0),
        }
    }

    /// Placement of an image that already is the size of the canvas.
    pub fn identity(canvas_size: u32) -> Self {
        Self::new(canvas_size, canvas_size, canvas_size)
    }

    pub fn canvas_size(&self) -> u32 {
        self.canvas_size
    }

    pub fn original_size(&self) -> (u32, u32) {
        (self.original_width, self.original_height)
    }

    /// Factor from original image coordinates to canvas coordinates.
    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn offset(&self) -> (f32, f32) {
        self.offset
    }

    /// Size of the resized image on the canvas, before padding.
    pub fn resized_size(&self) -> (usize, usize) {
        let side = |v: u32| {
            ((v as f32 * self.scale).round() as usize).clamp(1, self.canvas_size as usize)
        };
        (side(self.original_width), side(self.original_height))
    }

    /// Maps a box from original image coordinates onto the canvas.
    pub fn to_canvas(&self, rect: Rect) -> Rect {
        rect.scale_coords(self.scale)
            .move_by(self.offset.0, self.offset.1)
    }

    /// Maps a box from canvas coordinates back to original image coordinates.
    pub fn to_original(&self, rect: Rect) -> Rect {
        rect.move_by(-self.offset.0, -self.offset.1)
            .scale_coords(self.scale.recip())
    }
}

/// A preprocessed batch, ready for the network.
#[derive(Debug)]
pub struct Batch {
    /// `[batch, 3, canvas, canvas]` normalized images.
    pub images: Array4<f32>,
    pub metas: Vec<CanvasMeta>,
    /// Targets mapped into canvas coordinates, if any were given.
    pub targets: Option<Vec<Target>>,
}

/// Normalizes, resizes and pads images onto the square canvas.
#[derive(Debug, Clone)]
pub struct PreProcess {
    mean: [f32; 3],
    std: [f32; 3],
}

impl PreProcess {
    pub fn new(mean: [f32; 3], std: [f32; 3]) -> Self {
        assert!(
            std.iter().all(|&s| s > 0.0),
            "standard deviations must be positive, got {:?}",
            std
        );
        Self { mean, std }
    }

    /// Prepares a batch of `[3, height, width]` images with values in `[0, 1]`.
    ///
    /// Boxes of `targets`, if given, are mapped into canvas coordinates alongside.
    ///
    /// # Panics
    ///
    /// Panics if an image does not have 3 channels or is empty, or if the number of targets does
    /// not match the number of images.
    pub fn process(
        &self,
        images: &[Array3<f32>],
        targets: Option<&[Target]>,
        canvas_size: u32,
    ) -> Batch {
        if let Some(targets) = targets {
            assert_eq!(
                targets.len(),
                images.len(),
                "got {} targets for {} images",
                targets.len(),
                images.len()
            );
        }

        let canvas = canvas_size as usize;
        let placed = images
            .par_iter()
            .map(|image| self.place(image, canvas_size))
            .collect::<Vec<_>>();

        let mut batch = Array4::zeros((images.len(), 3, canvas, canvas));
        let mut metas = Vec::with_capacity(images.len());
        for (mut dest, (resized, meta)) in batch.outer_iter_mut().zip(placed) {
            let (w, h) = meta.resized_size();
            dest.slice_mut(s![.., ..h, ..w]).assign(&resized);
            metas.push(meta);
        }

        let targets = targets.map(|targets| {
            targets
                .iter()
                .zip(&metas)
                .map(|(target, meta)| target.map_boxes(|b| meta.to_canvas(b)))
                .collect()
        });

        Batch {
            images: batch,
            metas,
            targets,
        }
    }

    /// Normalizes and resizes one image, returning the unpadded result.
    fn place(&self, image: &Array3<f32>, canvas_size: u32) -> (Array3<f32>, CanvasMeta) {
        let (channels, height, width) = image.dim();
        assert_eq!(channels, 3, "expected a 3-channel image, got {} channels", channels);
        assert!(
            height > 0 && width > 0,
            "cannot process an empty {}x{} image",
            width,
            height
        );

        let meta = CanvasMeta::new(canvas_size, width as u32, height as u32);
        let (out_w, out_h) = meta.resized_size();
        let mut out = Array3::zeros((3, out_h, out_w));
        for (c, (src, mut dest)) in image
            .outer_iter()
            .zip(out.outer_iter_mut())
            .enumerate()
        {
            let resized = resize_bilinear(src, out_h, out_w);
            let (mean, std) = (self.mean[c], self.std[c]);
            dest.zip_mut_with(&resized, |d, &v| *d = (v - mean) / std);
        }
        log::trace!(
            "placed {}x{} image at {}x{} on a {} canvas",
            width,
            height,
            out_w,
            out_h,
            canvas_size
        );
        (out, meta)
    }
}

/// Resizes a single channel with bilinear interpolation, sampling at pixel centers.
fn resize_bilinear(src: ArrayView2<'_, f32>, out_h: usize, out_w: usize) -> Array2<f32> {
    let (in_h, in_w) = src.dim();
    let taps = |out: usize, input: usize| {
        let ratio = input as f32 / out as f32;
        (0..out)
            .map(|o| {
                let pos = ((o as f32 + 0.5) * ratio - 0.5).max(0.0);
                let i0 = (pos as usize).min(input - 1);
                let i1 = (i0 + 1).min(input - 1);
                (i0, i1, pos - i0 as f32)
            })
            .collect::<Vec<_>>()
    };
    let ys = taps(out_h, in_h);
    let xs = taps(out_w, in_w);

    Array2::from_shape_fn((out_h, out_w), |(y, x)| {
        let (y0, y1, fy) = ys[y];
        let (x0, x1, fx) = xs[x];
        let top = src[[y0, x0]] * (1.0 - fx) + src[[y0, x1]] * fx;
        let bottom = src[[y1, x0]] * (1.0 - fx) + src[[y1, x1]] * fx;
        top * (1.0 - fy) + bottom * fy
    })
}
