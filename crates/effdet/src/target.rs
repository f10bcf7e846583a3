use effdet_geom::Rect;

/// The ground truth objects of one image.
///
/// An empty target (an image without objects) is valid.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Target {
    labels: Vec<u32>,
    boxes: Vec<Rect>,
}

impl Target {
    /// Creates a target from parallel lists of class ids and corner-form boxes.
    ///
    /// # Panics
    ///
    /// Panics if `labels` and `boxes` differ in length.
    #[track_caller]
    pub fn new(labels: Vec<u32>, boxes: Vec<Rect>) -> Self {
        assert_eq!(
            labels.len(),
            boxes.len(),
            "target has {} labels but {} boxes",
            labels.len(),
            boxes.len()
        );
        Self { labels, boxes }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn push(&mut self, label: u32, rect: Rect) {
        self.labels.push(label);
        self.boxes.push(rect);
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    pub fn boxes(&self) -> &[Rect] {
        &self.boxes
    }

    /// Returns a copy with every box passed through `map` (eg. into canvas coordinates).
    pub fn map_boxes(&self, map: impl Fn(Rect) -> Rect) -> Self {
        Self {
            labels: self.labels.clone(),
            boxes: self.boxes.iter().map(|&b| map(b)).collect(),
        }
    }
}
