use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for the network runtime.
///
/// Covers the bind address, selector threading, framing limits, the four
/// worker pools, connection timeouts, and the liveness watchdog. Use
/// ServerConfig::builder() for ergonomic construction; unset fields fall
/// back to the defaults below.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address the listening socket binds to.
    pub address: SocketAddr,
    /// Number of selector (dispatcher) threads. Connections are assigned
    /// round-robin at accept time.
    pub selector_count: usize,
    /// Upper bound on the wire `length` field. A header declaring more is a
    /// protocol violation.
    pub max_packet_size: usize,
    /// Size of read buffers drawn from the buffer pool.
    pub read_buffer_size: usize,
    /// Number of buffers the pool retains when idle.
    pub buffer_pool_size: usize,
    /// Hard limit on concurrent connections (None for unlimited).
    pub max_connections: Option<usize>,
    /// TCP_NODELAY on accepted sockets.
    pub no_delay: bool,
    /// Workers executing inbound packet handlers.
    pub inbound_workers: usize,
    /// Bound on queued-but-not-started inbound tasks; submissions beyond it
    /// are rejected (None for unbounded).
    pub inbound_queue_capacity: Option<usize>,
    /// Workers executing server-originated (outbound) work, kept separate so
    /// a slow inbound handler cannot starve outbound traffic.
    pub outbound_workers: usize,
    /// Workers finalizing disconnections. Small, drained fully on shutdown.
    pub disconnection_workers: usize,
    /// Workers for the delay/fixed-rate scheduler.
    pub scheduled_workers: usize,
    /// Close connections with no inbound traffic inside this window
    /// (None disables the idle probe).
    pub idle_timeout: Option<Duration>,
    /// How long a Closing connection may keep flushing its outbound queue
    /// before it is closed regardless.
    pub close_grace: Duration,
    /// Per-pool drain budget during shutdown (the disconnection pool uses
    /// disconnection_drain_grace instead).
    pub shutdown_grace: Duration,
    /// Drain budget for the disconnection pool; its job is to finish closing
    /// sockets, so it gets a generous window.
    pub disconnection_drain_grace: Duration,
    /// Watchdog sampling interval.
    pub deadlock_sample_interval: Duration,
    /// Consecutive no-progress samples before the recovery action fires.
    pub deadlock_restart_threshold: u32,
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7777".parse().unwrap(),
            selector_count: 2,
            max_packet_size: 8 * 1024,
            read_buffer_size: 8192,
            buffer_pool_size: 32,
            max_connections: None,
            no_delay: true,
            inbound_workers: 6,
            inbound_queue_capacity: Some(10_000),
            outbound_workers: 4,
            disconnection_workers: 2,
            scheduled_workers: 4,
            idle_timeout: Some(Duration::from_secs(300)),
            close_grace: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(2),
            disconnection_drain_grace: Duration::from_secs(60),
            deadlock_sample_interval: Duration::from_secs(60),
            deadlock_restart_threshold: 3,
        }
    }
}

/// Builder for ServerConfig.
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
        }
    }

    pub fn address(mut self, address: SocketAddr) -> Self {
        self.config.address = address;
        self
    }

    pub fn selector_count(mut self, count: usize) -> Self {
        self.config.selector_count = count.max(1);
        self
    }

    pub fn max_packet_size(mut self, size: usize) -> Self {
        self.config.max_packet_size = size;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    pub fn buffer_pool_size(mut self, size: usize) -> Self {
        self.config.buffer_pool_size = size;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = Some(max);
        self
    }

    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.config.no_delay = enabled;
        self
    }

    pub fn inbound_workers(mut self, count: usize) -> Self {
        self.config.inbound_workers = count.max(1);
        self
    }

    pub fn inbound_queue_capacity(mut self, capacity: Option<usize>) -> Self {
        self.config.inbound_queue_capacity = capacity;
        self
    }

    pub fn outbound_workers(mut self, count: usize) -> Self {
        self.config.outbound_workers = count.max(1);
        self
    }

    pub fn disconnection_workers(mut self, count: usize) -> Self {
        self.config.disconnection_workers = count.max(1);
        self
    }

    pub fn scheduled_workers(mut self, count: usize) -> Self {
        self.config.scheduled_workers = count.max(1);
        self
    }

    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    pub fn close_grace(mut self, grace: Duration) -> Self {
        self.config.close_grace = grace;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    pub fn disconnection_drain_grace(mut self, grace: Duration) -> Self {
        self.config.disconnection_drain_grace = grace;
        self
    }

    pub fn deadlock_sample_interval(mut self, interval: Duration) -> Self {
        self.config.deadlock_sample_interval = interval;
        self
    }

    pub fn deadlock_restart_threshold(mut self, samples: u32) -> Self {
        self.config.deadlock_restart_threshold = samples.max(1);
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}

impl Default for ServerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
