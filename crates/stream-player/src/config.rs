/// Flow-control thresholds for a streaming session.
#[derive(Clone, Debug)]
pub struct PlayerConfig {
    /// Number of fixed hardware buffers cycled through the device.
    pub buffer_count: usize,
    /// Buffered audio required before the device is configured and started.
    pub start_threshold_seconds: f64,
    /// Audio placed in each buffer on refill.
    pub refill_window_seconds: f64,
    /// Unread backlog that wakes buffers parked after a starved refill.
    pub resume_threshold_seconds: f64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            buffer_count: 3,
            start_threshold_seconds: 3.0,
            refill_window_seconds: 5.0,
            resume_threshold_seconds: 1.0,
        }
    }
}

impl PlayerConfig {
    /// Replace non-finite or non-positive values with defaults and keep at least one buffer.
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        self.buffer_count = self.buffer_count.max(1);
        if !(self.start_threshold_seconds.is_finite() && self.start_threshold_seconds > 0.0) {
            self.start_threshold_seconds = defaults.start_threshold_seconds;
        }
        if !(self.refill_window_seconds.is_finite() && self.refill_window_seconds > 0.0) {
            self.refill_window_seconds = defaults.refill_window_seconds;
        }
        if !(self.resume_threshold_seconds.is_finite() && self.resume_threshold_seconds >= 0.0) {
            self.resume_threshold_seconds = defaults.resume_threshold_seconds;
        }
        self
    }
}
