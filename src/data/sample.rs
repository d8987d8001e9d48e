use crate::error::Result;

/// One test example: the canonical image in `views[0]` followed by its
/// augmented views. Discarded after its loop iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub index: usize,
    pub views: Vec<Vec<f64>>,
    pub label: usize,
}

/// Finite, sequential source of samples. Only restartable through
/// [`TestStream::skip_to`].
pub trait TestStream {
    /// Total number of samples, including any skipped ones.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Positions the stream so the next sample yielded has `index`.
    fn skip_to(&mut self, index: usize);

    fn next_sample(&mut self) -> Result<Option<Sample>>;
}

/// In-memory stream over pre-built samples; indices are positions.
#[derive(Debug, Clone)]
pub struct VecStream {
    samples: Vec<(Vec<Vec<f64>>, usize)>,
    cursor: usize,
}

impl VecStream {
    /// `samples` are `(views, label)` pairs.
    pub fn new(samples: Vec<(Vec<Vec<f64>>, usize)>) -> Self {
        VecStream { samples, cursor: 0 }
    }
}

impl TestStream for VecStream {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn skip_to(&mut self, index: usize) {
        self.cursor = index.min(self.samples.len());
    }

    fn next_sample(&mut self) -> Result<Option<Sample>> {
        let Some((views, label)) = self.samples.get(self.cursor) else {
            return Ok(None);
        };
        let sample = Sample { index: self.cursor, views: views.clone(), label: *label };
        self.cursor += 1;
        Ok(Some(sample))
    }
}
