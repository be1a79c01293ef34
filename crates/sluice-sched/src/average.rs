/// Fixed-window moving average over the last `periods` samples.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    samples: Vec<u64>,
    next: usize,
    filled: usize,
}

impl MovingAverage {
    pub fn new(periods: usize) -> Self {
        Self {
            samples: vec![0; periods.max(1)],
            next: 0,
            filled: 0,
        }
    }

    pub fn update(&mut self, sample: u64) {
        self.samples[self.next] = sample;
        self.next = (self.next + 1) % self.samples.len();
        self.filled = (self.filled + 1).min(self.samples.len());
    }

    /// Average of the samples seen so far, 0 before the first one.
    pub fn average(&self) -> u64 {
        if self.filled == 0 {
            return 0;
        }
        self.sum() / self.filled as u64
    }

    /// True when every sample in the window is zero. Unlike `average() == 0`
    /// this does not round a trickle down to nothing.
    pub fn is_zero(&self) -> bool {
        self.sum() == 0
    }

    fn sum(&self) -> u64 {
        self.samples.iter().take(self.filled).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_only_filled_slots() {
        let mut avg = MovingAverage::new(5);
        assert_eq!(avg.average(), 0);
        avg.update(10);
        avg.update(20);
        assert_eq!(avg.average(), 15);
    }

    #[test]
    fn trickle_is_not_zero() {
        let mut avg = MovingAverage::new(5);
        assert!(avg.is_zero());
        avg.update(1);
        avg.update(0);
        assert_eq!(avg.average(), 0);
        assert!(!avg.is_zero());
        for _ in 0..4 {
            avg.update(0);
        }
        assert!(avg.is_zero());
    }

    #[test]
    fn old_samples_fall_out_of_the_window() {
        let mut avg = MovingAverage::new(2);
        avg.update(100);
        avg.update(0);
        avg.update(0);
        assert_eq!(avg.average(), 0);
    }
}
