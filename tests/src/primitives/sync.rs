//! Semaphore and SpinFlag Tests

#[cfg(test)]
mod tests {
    use crate::sync::{Semaphore, SpinFlag};

    // =========================================================================
    // Counting semaphore
    // =========================================================================

    #[test]
    fn test_semaphore_wait_decrements() {
        let sem = Semaphore::new(2);
        assert_eq!(sem.wait(), 1);
        assert_eq!(sem.wait(), 0);
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn test_semaphore_release_increments() {
        let sem = Semaphore::new(0);
        assert_eq!(sem.release(), 1);
        assert_eq!(sem.release(), 2);
        assert_eq!(sem.count(), 2);
    }

    #[test]
    fn test_semaphore_lockdown_returns_prior_count() {
        let sem = Semaphore::new(0);
        sem.release();
        sem.release();
        sem.release();
        assert_eq!(sem.lockdown(), 3);
        assert_eq!(sem.count(), u32::MAX);
    }

    #[test]
    fn test_semaphore_release_after_lockdown_reports_race() {
        let sem = Semaphore::new(5);
        sem.lockdown();

        // The loser gets 0 back and the count must not move off the
        // sentinel.
        assert_eq!(sem.release(), 0);
        assert_eq!(sem.count(), u32::MAX);
        assert_eq!(sem.release(), 0);
        assert_eq!(sem.count(), u32::MAX);
    }

    #[test]
    fn test_semaphore_reset_clears_lockdown() {
        let sem = Semaphore::new(0);
        sem.lockdown();
        sem.reset(0);
        assert_eq!(sem.count(), 0);
        assert_eq!(sem.release(), 1);
    }

    #[test]
    fn test_semaphore_wait_release_across_threads() {
        let sem = Semaphore::new(0);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                // Parked until the main thread posts.
                assert_eq!(sem.wait(), 0);
            });
            sem.release();
        });
        assert_eq!(sem.count(), 0);
    }

    // =========================================================================
    // SpinFlag
    // =========================================================================

    #[test]
    fn test_spinflag_acquire_release() {
        let flag = SpinFlag::new();
        assert!(!flag.is_held());
        flag.acquire();
        assert!(flag.is_held());
        flag.release();
        assert!(!flag.is_held());
    }

    #[test]
    fn test_spinflag_try_acquire_fails_when_held() {
        let flag = SpinFlag::new();
        assert!(flag.try_acquire());
        assert!(!flag.try_acquire());
        flag.release();
        assert!(flag.try_acquire());
    }

    #[test]
    fn test_spinflag_reset_forces_release() {
        let flag = SpinFlag::new();
        flag.acquire();
        flag.reset();
        assert!(!flag.is_held());
        assert!(flag.try_acquire());
    }
}
