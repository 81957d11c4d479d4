use anyhow::bail;
use std::net::SocketAddr;
use std::time::Duration;

/// Engine configuration. [EngineConfig::for_addr] gives usable defaults; `validate` is
///  called at engine construction and rejects combinations the engine cannot run with.
pub struct EngineConfig {
    pub bind_addr: SocketAddr,

    /// Number of workers issuing concurrent receives on the shared socket. More workers
    ///  reduce kernel-queue backlog under load; there is no benefit beyond the number of
    ///  physical cores.
    pub receive_worker_count: usize,

    /// Number of workers draining the shared inbound queue in batches.
    pub processing_worker_count: usize,

    /// Period of the tick scheduler, or `None` to run without one. 20 Hz is 50ms.
    pub tick_interval: Option<Duration>,

    /// The MTU budget: upper bound for an encoded envelope. Oversized sends are rejected
    ///  before any socket call - the engine never fragments. This must be supported by all
    ///  network paths between peers; 1400 leaves headroom for IP/UDP headers within a
    ///  full Ethernet frame.
    pub mtu: usize,

    /// How long to wait for an acknowledgement before resending a reliable message.
    pub ack_timeout: Duration,

    /// Period of the background sweep that checks pending acknowledgements for timeout.
    pub ack_sweep_interval: Duration,

    /// Resend budget per reliable message. When exhausted the destination is reported lost.
    pub max_ack_tries: u32,

    /// Upper bound on queued inbound datagrams; datagrams beyond it are dropped with a
    ///  warning rather than growing the queue without bound.
    pub inbound_queue_capacity: usize,

    /// Maximum datagrams drained per processing cycle.
    pub batch_size: usize,

    /// Batches larger than this are dispatched data-parallel, smaller ones sequentially.
    pub parallel_dispatch_threshold: usize,

    /// OS-level socket buffer size. Kept small: this engine trades throughput for
    ///  end-to-end latency.
    pub socket_buffer_bytes: usize,
}

impl EngineConfig {
    pub fn for_addr(bind_addr: SocketAddr) -> EngineConfig {
        let parallelism = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(1);

        EngineConfig {
            bind_addr,
            receive_worker_count: (parallelism / 2).max(1),
            processing_worker_count: parallelism,
            tick_interval: Some(Duration::from_millis(50)),
            mtu: 1400,
            ack_timeout: Duration::from_millis(5000),
            ack_sweep_interval: Duration::from_millis(10),
            max_ack_tries: 7,
            inbound_queue_capacity: 4096,
            batch_size: 64,
            parallel_dispatch_threshold: 2,
            socket_buffer_bytes: 1024 * 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.receive_worker_count == 0 {
            bail!("at least one receive worker is required");
        }
        if self.processing_worker_count == 0 {
            bail!("at least one processing worker is required");
        }
        if self.mtu < 100 {
            bail!("MTU budget of {} bytes is too small to be useful", self.mtu);
        }
        if self.batch_size == 0 {
            bail!("batch size must be at least 1");
        }
        if self.max_ack_tries == 0 {
            bail!("at least one ack try is required");
        }
        if self.ack_sweep_interval > self.ack_timeout {
            bail!("ack sweep interval must not exceed the ack timeout");
        }
        if let Some(tick) = self.tick_interval {
            if tick.is_zero() {
                bail!("tick interval must not be zero");
            }
        }
        Ok(())
    }

    /// Recency window for the seen-ack cache: long enough to cover every retransmission
    ///  the peer may still make.
    pub fn seen_ack_window(&self) -> Duration {
        self.ack_timeout * self.max_ack_tries
    }
}
