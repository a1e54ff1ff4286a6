//! Coarse progress reporting.

/// Receives progress milestones (0-100).
///
/// Implementations must not fail the run: reporting errors are logged and
/// dropped.
pub trait Progress {
    fn report(&self, percent: u8, message: &str);
}

/// Discards every report.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn report(&self, _percent: u8, _message: &str) {}
}

impl<F: Fn(u8, &str)> Progress for F {
    fn report(&self, percent: u8, message: &str) {
        self(percent, message)
    }
}

/// Milestone for component `index` (0-based) of `total` while signing.
pub fn signing_milestone(index: usize, total: usize) -> u8 {
    let total = total.max(1);
    (50 + (index + 1) * 30 / total).min(80) as u8
}
