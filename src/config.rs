use std::time::Duration;

/// RelayConfig carries the tunables of the relay engine
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Receive buffer size per TCP session
    pub buffer_size: usize,

    /// Upper bound on a single write to a destination socket
    pub write_timeout: Duration,

    /// A UDP mapping idle for longer than this is evicted
    pub udp_idle_timeout: Duration,

    /// How often the UDP mapping table is swept
    pub udp_sweep_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: 8 * 1024,
            write_timeout: Duration::from_secs(5),
            udp_idle_timeout: Duration::from_millis(60_000),
            udp_sweep_interval: Duration::from_millis(1_000),
        }
    }
}

impl RelayConfig {
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }
}
