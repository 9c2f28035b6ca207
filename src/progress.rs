//! Flashing progress callbacks

/// Events emitted while flashing. Handed to [crate::flasher::Flasher::run]
/// by the caller; implementations must not call back into the engine.
pub trait FlashObserver {
    /// Total number of blocks written so far, across all images. Rewinds
    /// when a failed image is retried.
    fn progress(&mut self, written: u32);
    /// A human-readable note about what the engine is doing.
    fn status(&mut self, message: &str);
}

/// Observer that discards every event.
#[derive(Debug, Default)]
pub struct SilentObserver;

impl FlashObserver for SilentObserver {
    fn progress(&mut self, _written: u32) {}

    fn status(&mut self, _message: &str) {}
}
