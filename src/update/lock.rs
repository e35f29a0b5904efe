//! Single-flight execution guard.

use parking_lot::Mutex;

/// Returned by [`SingleFlight::try_run_exclusive`] when the guard is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Busy;

/// Runs at most one closure at a time.
///
/// Both entry points share one mutex, so a blocking and a non-blocking
/// caller can never overlap. The mutex is released on every exit path,
/// including unwinding.
#[derive(Debug, Default)]
pub struct SingleFlight {
    lock: Mutex<()>,
}

impl SingleFlight {
    /// Create an idle guard.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until the guard is free, then run `f`.
    pub fn run_exclusive<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.lock.lock();
        f()
    }

    /// Run `f` only if the guard is free right now.
    ///
    /// # Errors
    ///
    /// Returns [`Busy`] without running `f` if another closure is running.
    pub fn try_run_exclusive<R>(&self, f: impl FnOnce() -> R) -> Result<R, Busy> {
        let Some(_guard) = self.lock.try_lock() else {
            return Err(Busy);
        };
        Ok(f())
    }

    /// Whether a closure is running.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.lock.is_locked()
    }
}
