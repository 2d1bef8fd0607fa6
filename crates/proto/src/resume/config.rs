//! Resumption configuration.

use std::time::Duration;

/// Tunable options for the resumption layer.
///
/// These five options are the whole configurable surface; all other
/// protocol behavior is fixed.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use limpet_proto::resume::ResumeConfig;
///
/// let config = ResumeConfig::new()
///     .with_detached_timeout(Duration::from_secs(30))
///     .with_send_buffer_capacity(256 * 1024);
///
/// assert_eq!(config.detached_timeout, Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeConfig {
    /// Grace period a session with no transport is kept alive awaiting
    /// reattachment.
    pub detached_timeout: Duration,
    /// Maximum bytes of locally produced, unacknowledged data; writers
    /// block at this bound.
    pub send_buffer_capacity: usize,
    /// Maximum bytes of received, undelivered data. Both peers must use
    /// the same value: it is the flow-control window the sender assumes.
    pub recv_buffer_capacity: usize,
    /// Delivered-byte progress that forces an acknowledgement frame.
    pub ack_threshold: usize,
    /// Maximum interval between acknowledgements while progress exists.
    pub ack_max_interval: Duration,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            detached_timeout: Duration::from_secs(60),
            send_buffer_capacity: 512 * 1024,
            recv_buffer_capacity: 512 * 1024,
            ack_threshold: 64 * 1024,
            ack_max_interval: Duration::from_secs(1),
        }
    }
}

impl ResumeConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the detached timeout.
    pub fn with_detached_timeout(mut self, timeout: Duration) -> Self {
        self.detached_timeout = timeout;
        self
    }

    /// Sets the send buffer capacity.
    pub fn with_send_buffer_capacity(mut self, capacity: usize) -> Self {
        self.send_buffer_capacity = capacity;
        self
    }

    /// Sets the receive buffer capacity.
    pub fn with_recv_buffer_capacity(mut self, capacity: usize) -> Self {
        self.recv_buffer_capacity = capacity;
        self
    }

    /// Sets the acknowledgement byte threshold.
    pub fn with_ack_threshold(mut self, threshold: usize) -> Self {
        self.ack_threshold = threshold;
        self
    }

    /// Sets the maximum acknowledgement interval.
    pub fn with_ack_max_interval(mut self, interval: Duration) -> Self {
        self.ack_max_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = ResumeConfig::default();
        assert_eq!(config.detached_timeout, Duration::from_secs(60));
        assert_eq!(config.send_buffer_capacity, 512 * 1024);
        assert_eq!(config.recv_buffer_capacity, 512 * 1024);
        assert_eq!(config.ack_threshold, 64 * 1024);
        assert_eq!(config.ack_max_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_config_builder() {
        let config = ResumeConfig::new()
            .with_detached_timeout(Duration::from_secs(5))
            .with_send_buffer_capacity(1024)
            .with_recv_buffer_capacity(2048)
            .with_ack_threshold(256)
            .with_ack_max_interval(Duration::from_millis(100));

        assert_eq!(config.detached_timeout, Duration::from_secs(5));
        assert_eq!(config.send_buffer_capacity, 1024);
        assert_eq!(config.recv_buffer_capacity, 2048);
        assert_eq!(config.ack_threshold, 256);
        assert_eq!(config.ack_max_interval, Duration::from_millis(100));
    }
}
