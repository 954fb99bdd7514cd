use std::sync::atomic::{AtomicUsize, Ordering};

/// Number of worker threads granted to CPU-bound stages.
///
/// The controller thread is the only writer. Detection, cataloguing and the
/// stage executor read it before each parallel section.
/// The value always stays within `1..=max`.
#[derive(Debug)]
pub struct WorkerBudget {
    current: AtomicUsize,
    max: usize,
}

impl WorkerBudget {
    pub fn new(max: usize) -> Self {
        let max = max.max(1);
        Self {
            current: AtomicUsize::new(max),
            max,
        }
    }

    /// Budget sized to the machine's available parallelism.
    pub fn from_available_cores() -> Self {
        Self::new(
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        )
    }

    pub fn get(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn set(&self, threads: usize) {
        self.current
            .store(threads.clamp(1, self.max), Ordering::Release);
    }

    /// Sets aside one core for background work.
    pub fn reserve_one(&self) {
        self.set(self.max.saturating_sub(1));
    }

    /// Returns the whole budget to the foreground path.
    pub fn restore(&self) {
        self.set(self.max);
    }

    pub fn is_reduced(&self) -> bool {
        self.get() < self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_restore() {
        let budget = WorkerBudget::new(8);
        assert_eq!(budget.get(), 8);

        budget.reserve_one();
        assert_eq!(budget.get(), 7);
        assert!(budget.is_reduced());

        budget.restore();
        assert_eq!(budget.get(), 8);
    }

    #[test]
    fn never_drops_below_one() {
        let budget = WorkerBudget::new(1);
        budget.reserve_one();
        assert_eq!(budget.get(), 1);

        budget.set(0);
        assert_eq!(budget.get(), 1);

        budget.set(64);
        assert_eq!(budget.get(), 1);
    }

    #[test]
    fn zero_max_is_clamped() {
        let budget = WorkerBudget::new(0);
        assert_eq!(budget.max(), 1);
        assert_eq!(budget.get(), 1);
    }
}
