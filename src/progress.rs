/// Progress update callbacks
///
/// Long-running flash operations report progress through this trait; the
/// callbacks are invoked on the calling thread and must not block.
pub trait ProgressCallbacks {
    /// Initialize some progress report
    fn init(&mut self, addr: u64, total: usize);
    /// Update some progress report
    fn update(&mut self, current: usize);
    /// Finish some progress report
    fn finish(&mut self);
}

/// Discards all progress updates.
pub struct NoProgress;

impl ProgressCallbacks for NoProgress {
    fn init(&mut self, _addr: u64, _total: usize) {}
    fn update(&mut self, _current: usize) {}
    fn finish(&mut self) {}
}
