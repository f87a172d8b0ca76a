use std::time::Duration;

/// Size of each process output buffer; also the default flush threshold.
pub const PROCESS_BUFFER_SIZE: usize = 65536;

/// Tunables shared by both engines.
#[derive(Debug, Clone)]
pub struct HookConfig {
    /// Supervisor tick for tasks with a timeout above one tick (or none).
    pub tick_interval: Duration,
    pub buffer_capacity: usize,
    /// Bytes requested per `read(2)` on a child pipe.
    pub read_chunk: usize,
    /// Upper bound on poll rounds when draining a finished child.
    pub drain_max_iterations: usize,
    pub reap_interval: Duration,
    pub reap_attempts: u32,
    pub user_agent: String,
    pub follow_location: bool,
    pub proxy: Option<String>,
}

impl Default for HookConfig {
    fn default() -> Self {
        HookConfig {
            tick_interval: Duration::from_millis(100),
            buffer_capacity: PROCESS_BUFFER_SIZE,
            read_chunk: PROCESS_BUFFER_SIZE / 8,
            drain_max_iterations: 1024,
            reap_interval: Duration::from_millis(100),
            reap_attempts: 50,
            user_agent: concat!("task-hooks/", env!("CARGO_PKG_VERSION")).to_string(),
            follow_location: true,
            proxy: None,
        }
    }
}

impl HookConfig {
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity.max(1);
        self.read_chunk = self.read_chunk.min(self.buffer_capacity);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn with_follow_location(mut self, follow: bool) -> Self {
        self.follow_location = follow;
        self
    }
}
