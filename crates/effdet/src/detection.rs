//! Detection results and the inference-side stages that produce them.

pub mod anchor;
pub mod nms;
pub mod postprocess;

use effdet_geom::Rect;

/// A detected object.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    rect: Rect,
    class: u32,
    score: f32,
}

impl Detection {
    pub fn new(rect: Rect, class: u32, score: f32) -> Self {
        Self { rect, class, score }
    }

    /// Returns the corner-form bounding box.
    pub fn bounding_rect(&self) -> Rect {
        self.rect
    }

    pub fn set_bounding_rect(&mut self, rect: Rect) {
        self.rect = rect;
    }

    pub fn class(&self) -> u32 {
        self.class
    }

    /// The class probability, between 0.0 and 1.0.
    pub fn score(&self) -> f32 {
        self.score
    }
}

/// A collection of detections bucketed by class.
#[derive(Debug, Default)]
pub struct Detections {
    // FIXME: make this sparse, there are 90 classes and most are empty for any given image
    vec: Vec<Vec<Detection>>,
}

impl Detections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of detections across all classes.
    pub fn len(&self) -> usize {
        self.vec.iter().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.vec.iter().all(|v| v.is_empty())
    }

    pub fn clear(&mut self) {
        for class in &mut self.vec {
            class.clear();
        }
    }

    pub fn push(&mut self, detection: Detection) {
        let raw_class = detection.class() as usize;
        if self.vec.len() <= raw_class {
            self.vec.resize_with(raw_class + 1, Vec::new);
        }

        self.vec[raw_class].push(detection);
    }

    /// Returns an iterator that yields all detections of the given class.
    pub fn for_class(&self, class: u32) -> impl Iterator<Item = &Detection> {
        self.vec
            .get(class as usize)
            .into_iter()
            .flat_map(|v| v.iter())
    }

    /// Yields all detections, in ascending class order.
    pub fn iter(&self) -> impl Iterator<Item = &Detection> {
        self.vec.iter().flat_map(|v| v.iter())
    }

    /// Gives mutable access to each non-empty class bucket.
    pub(crate) fn classes_mut(&mut self) -> impl Iterator<Item = &mut Vec<Detection>> {
        self.vec.iter_mut().filter(|v| !v.is_empty())
    }
}

/// The final detections of one image, in original image coordinates.
///
/// The three lists are parallel and sorted by descending score.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageDetections {
    /// `[left, top, right, bottom]` boxes.
    pub boxes: Vec<[f32; 4]>,
    pub labels: Vec<u32>,
    pub scores: Vec<f32>,
}

impl ImageDetections {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Detection> + '_ {
        self.boxes
            .iter()
            .zip(&self.labels)
            .zip(&self.scores)
            .map(|((&b, &label), &score)| Detection::new(Rect::from_ltrb_array(b), label, score))
    }
}

impl FromIterator<Detection> for ImageDetections {
    fn from_iter<I: IntoIterator<Item = Detection>>(iter: I) -> Self {
        let mut out = Self::default();
        for det in iter {
            out.boxes.push(det.bounding_rect().ltrb());
            out.labels.push(det.class());
            out.scores.push(det.score());
        }
        out
    }
}
