use std::sync::atomic::{AtomicBool, Ordering};

/// In-process "already running" flag for one periodic job.
///
/// Acquisition never blocks: a caller that loses the race is expected to skip
/// its cycle. Prefer [`SingleFlightGuard::enter`], whose permit releases the
/// flag on every exit path including unwinding.
#[derive(Debug, Default)]
pub struct SingleFlightGuard {
    running: AtomicBool,
}

impl SingleFlightGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flips the flag from idle to running; false if it was already running.
    pub fn try_acquire(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn enter(&self) -> Option<FlightPermit<'_>> {
        self.try_acquire().then_some(FlightPermit { guard: self })
    }
}

#[must_use = "the guard is released as soon as the permit is dropped"]
#[derive(Debug)]
pub struct FlightPermit<'a> {
    guard: &'a SingleFlightGuard,
}

impl Drop for FlightPermit<'_> {
    fn drop(&mut self) {
        self.guard.release();
    }
}
