use crate::error::TransportError;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Semaphore};
use tracing::{error, trace, warn};

/// Abstraction for sending a buffer on a UDP socket, introduced to facilitate mocking the
///  I/O part away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]);

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        trace!("UDP socket: sending packet of {} bytes to {:?}", packet_buf.len(), to);

        // sends are fire-and-forget at this level; reliability is the ack manager's job
        if let Err(e) = self.send_to(packet_buf, to).await {
            error!("error sending UDP packet to {:?}: {}", to, e);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref()
            .local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}

/// The outbound half of the engine: every send goes through here, and the MTU budget is
///  enforced before anything reaches the socket.
#[derive(Clone)]
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
    mtu: usize,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>, mtu: usize) -> SendPipeline {
        SendPipeline { socket, mtu }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub async fn send_packet(
        &self,
        to: SocketAddr,
        packet_buf: &[u8],
    ) -> Result<(), TransportError> {
        if packet_buf.len() > self.mtu {
            return Err(TransportError::SendOverflow {
                len: packet_buf.len(),
                mtu: self.mtu,
            });
        }
        self.socket.do_send_packet(to, packet_buf).await;
        Ok(())
    }
}

/// One received datagram, truncated to the number of bytes actually read.
#[derive(Debug)]
pub struct InboundDatagram {
    pub bytes: Vec<u8>,
    pub from: SocketAddr,
}

/// Bounded queue between the receive workers and the processing workers: a deque under a
///  mutex for the data, a counting semaphore for wakeups. Datagrams beyond the capacity
///  are dropped - backpressure on an unreliable transport means dropping, not blocking
///  the receive workers.
pub struct InboundQueue {
    queue: Mutex<VecDeque<InboundDatagram>>,
    signal: Semaphore,
    capacity: usize,
}

impl InboundQueue {
    pub fn new(capacity: usize) -> InboundQueue {
        InboundQueue {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            signal: Semaphore::new(0),
            capacity,
        }
    }

    /// Enqueues a datagram, returning false if it was dropped because the queue is full.
    pub fn push(&self, datagram: InboundDatagram) -> bool {
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= self.capacity {
                return false;
            }
            queue.push_back(datagram);
        }
        self.signal.add_permits(1);
        true
    }

    /// Waits until at least one datagram is queued, then drains up to `max` of them.
    ///  Returns `None` once the queue has been closed and a worker should shut down.
    ///
    /// NB: With several workers draining concurrently, a worker can be woken after its
    ///  datagrams were already drained by another; the resulting batch is empty and the
    ///  caller simply goes around its loop again.
    pub async fn next_batch(&self, max: usize) -> Option<Vec<InboundDatagram>> {
        match self.signal.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return None, // closed
        }

        let mut batch = Vec::new();
        {
            let mut queue = self.queue.lock().unwrap();
            while batch.len() < max {
                match queue.pop_front() {
                    Some(datagram) => batch.push(datagram),
                    None => break,
                }
            }
        }

        // one permit was consumed by the acquire above; consume one more per extra datagram
        for _ in 1..batch.len() {
            if let Ok(permit) = self.signal.try_acquire() {
                permit.forget();
            }
        }

        Some(batch)
    }

    /// Wakes all waiting workers and makes subsequent `next_batch` calls return `None`.
    pub fn close(&self) {
        self.signal.close();
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }
}

/// Binds the shared UDP socket with explicit buffer sizes. The buffers are deliberately
///  modest: this engine prefers dropping under extreme load over deep kernel queues and
///  the latency they add.
pub fn bind_socket(addr: SocketAddr, buffer_bytes: usize) -> anyhow::Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_recv_buffer_size(buffer_bytes)?;
    socket.set_send_buffer_size(buffer_bytes)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// One receive worker: issues receives on the shared socket and pushes completed ones onto
///  the inbound queue, immediately going back to receiving with a fresh buffer. Several of
///  these run concurrently to keep the kernel queue short under load.
pub async fn recv_loop(
    socket: Arc<UdpSocket>,
    queue: Arc<InboundQueue>,
    mtu: usize,
    mut cancelled: watch::Receiver<bool>,
    received_count: Arc<AtomicU64>,
) {
    loop {
        let mut buf = vec![0u8; mtu];
        tokio::select! {
            _ = cancelled.changed() => break,
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, from)) => {
                        trace!("received datagram of {} bytes from {:?}", len, from);
                        buf.truncate(len);
                        received_count.fetch_add(1, Ordering::Relaxed);
                        if !queue.push(InboundDatagram { bytes: buf, from }) {
                            warn!("inbound queue full - dropping datagram from {:?}", from);
                        }
                    }
                    Err(e) => {
                        error!("socket receive error: {}", e);
                    }
                }
            }
        }
    }
    trace!("receive worker shutting down");
}
