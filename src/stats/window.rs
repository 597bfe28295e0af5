//! Smoothing primitives for sampled metrics

use std::collections::VecDeque;

/// Fixed-capacity FIFO of recent samples
///
/// Pushing into a full window evicts the oldest sample.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl SlidingWindow {
    /// Create a window holding at most `capacity` samples (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: f32) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Mean of the retained samples, 0 when empty
    pub fn average(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f32>() / self.samples.len() as f32
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Exponential moving average
#[derive(Debug, Clone)]
pub struct ExponentialSmoother {
    alpha: f32,
    value: Option<f32>,
}

impl ExponentialSmoother {
    /// `alpha` is clamped to (0, 1]
    pub fn new(alpha: f32) -> Self {
        Self {
            alpha: alpha.clamp(f32::EPSILON, 1.0),
            value: None,
        }
    }

    /// Fold in a sample and return the smoothed value
    ///
    /// The first sample seeds the average.
    pub fn update(&mut self, sample: f32) -> f32 {
        let next = match self.value {
            Some(current) => current + (sample - current) * self.alpha,
            None => sample,
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<f32> {
        self.value
    }

    pub fn reset(&mut self) {
        self.value = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_evicts_oldest() {
        let mut window = SlidingWindow::new(3);
        for v in [10.0, 20.0, 30.0, 40.0] {
            window.push(v);
        }
        assert_eq!(window.len(), 3);
        assert!((window.average() - 30.0).abs() < 0.001);
    }

    #[test]
    fn test_window_empty_average() {
        let window = SlidingWindow::new(10);
        assert_eq!(window.average(), 0.0);
        assert!(window.is_empty());
    }

    #[test]
    fn test_window_zero_capacity_holds_one() {
        let mut window = SlidingWindow::new(0);
        window.push(1.0);
        window.push(2.0);
        assert_eq!(window.capacity(), 1);
        assert_eq!(window.average(), 2.0);
    }

    #[test]
    fn test_smoother_seeds_and_converges() {
        let mut smoother = ExponentialSmoother::new(0.1);
        assert_eq!(smoother.update(10.0), 10.0);

        // One step moves 10% of the way
        assert!((smoother.update(20.0) - 11.0).abs() < 0.001);

        for _ in 0..200 {
            smoother.update(20.0);
        }
        assert!((smoother.value().unwrap() - 20.0).abs() < 0.01);

        smoother.reset();
        assert!(smoother.value().is_none());
    }
}
