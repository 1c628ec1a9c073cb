//! Running averages for epoch summaries.

/// Mean loss over an epoch, weighted by the number of sentences per batch.
#[derive(Debug, Clone, Default)]
pub struct LossMeter {
    weighted_sum: f64,
    count: usize,
}

impl LossMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, loss: f64, batch_size: usize) {
        self.weighted_sum += loss * batch_size as f64;
        self.count += batch_size;
    }

    /// `None` until a batch has been recorded.
    pub fn average(&self) -> Option<f64> {
        (self.count > 0).then(|| self.weighted_sum / self.count as f64)
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
