//! Configuration for the request pipeline.

/// Default bound of the offline buffer: 4 MiB of encoded requests.
pub const DEFAULT_MAX_SIZE: usize = 4 * 1024 * 1024;

/// Configuration for the request pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Maximum total encoded size of the requests not yet acknowledged.
    /// 0 disables the bound.
    pub max_size: usize,
    /// First request id to hand out.
    pub first_request_id: u64,
}

impl PipelineConfig {
    /// Creates a configuration with the default bound.
    pub fn new() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            first_request_id: 1,
        }
    }

    /// Sets the buffer bound.
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Sets the first request id.
    pub fn with_first_request_id(mut self, id: u64) -> Self {
        self.first_request_id = id;
        self
    }

    /// Returns true if `size` more bytes fit next to `used`.
    pub fn admits(&self, used: usize, size: usize) -> bool {
        self.max_size == 0 || used.saturating_add(size) <= self.max_size
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new()
    }
}
