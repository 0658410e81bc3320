//! A simple counter for tracking archive operation results.
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::SeqCst;

/// A counter for tracking archive operation results.
pub struct Counter {
    ok: AtomicUsize,
    error: AtomicUsize,
    warning: AtomicUsize,
}

impl Counter {
    /// Creates a new Counter instance.
    pub fn new() -> Self {
        Self {
            ok: AtomicUsize::new(0),
            error: AtomicUsize::new(0),
            warning: AtomicUsize::new(0),
        }
    }

    /// Increments the count of entries processed successfully.
    pub fn inc_ok(&self) {
        self.ok.fetch_add(1, SeqCst);
    }

    /// Increments the count of errors.
    pub fn inc_error(&self) {
        self.error.fetch_add(1, SeqCst);
    }

    /// Increments the count of warnings.
    pub fn inc_warning(&self) {
        self.warning.fetch_add(1, SeqCst);
    }

    pub fn ok(&self) -> usize {
        self.ok.load(SeqCst)
    }

    pub fn errors(&self) -> usize {
        self.error.load(SeqCst)
    }

    pub fn warnings(&self) -> usize {
        self.warning.load(SeqCst)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "OK: {}, Error: {}, Warning: {}",
            self.ok.load(SeqCst),
            self.error.load(SeqCst),
            self.warning.load(SeqCst),
        )
    }
}

#[test]
fn test_counter_display() {
    let counter = Counter::new();
    counter.inc_ok();
    counter.inc_ok();
    counter.inc_warning();
    assert_eq!(counter.to_string(), "OK: 2, Error: 0, Warning: 1");
}
