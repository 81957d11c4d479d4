use crate::ack::{AckManager, ConnectionObserver};
use crate::config::EngineConfig;
use crate::envelope::{Envelope, MessageType};
use crate::error::TransportError;
use crate::peers::PeerRegistry;
use crate::pipeline::ProcessingPipeline;
use crate::registry::MessageRegistry;
use crate::socket::{bind_socket, recv_loop, InboundQueue, SendPipeline};
use crate::tick::tick_loop;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Addressing for one outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendTarget {
    Peer(SocketAddr),
    /// All currently registered peers.
    Broadcast,
    /// All currently registered peers except one - typically the originator of the state
    ///  being relayed.
    BroadcastExcept(SocketAddr),
}

/// When an outbound message actually hits the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOrder {
    /// On the caller's task, before `send` returns.
    Immediate,
    /// After the current processing batch completes. Lets a handler respond without its
    ///  response overtaking work queued earlier in the same batch.
    AfterProcessing,
    /// At the end of the next tick, after the tick handlers ran. The natural cadence for
    ///  aggregated state broadcasts.
    NextTick,
}

/// A deferred send, parked on one of the engine's queues until its [SendOrder] comes up.
pub(crate) enum QueuedSend {
    /// Already encoded, destination fixed. Used for unreliable single-peer sends, which
    ///  can be encoded eagerly.
    Encoded { bytes: Bytes, to: SocketAddr },
    /// Encoded at drain time: reliable messages get their per-destination ack ids then,
    ///  and broadcasts resolve the peer set then.
    Typed {
        msg_type: MessageType,
        payload: Bytes,
        target: SendTarget,
    },
}

pub(crate) struct EngineShared {
    pub(crate) config: EngineConfig,
    pub(crate) registry: Arc<MessageRegistry>,
    pub(crate) ack: Arc<AckManager>,
    pub(crate) send: SendPipeline,
    pub(crate) peers: PeerRegistry,
    pub(crate) inbound: Arc<InboundQueue>,

    after_processing: Mutex<Vec<QueuedSend>>,
    next_tick: Mutex<Vec<QueuedSend>>,

    /// Source of ack ids. Wrapping is safe: the id space outlives any realistic set of
    ///  in-flight reliable messages by orders of magnitude.
    ack_counter: AtomicU32,

    pub(crate) received_count: Arc<AtomicU64>,
    pub(crate) processed_count: Arc<AtomicU64>,

    cancel: watch::Sender<bool>,
}

/// The application's interface to a running engine: sending, peer management, counters.
///  Cheap to clone; handlers get a reference on every invocation.
#[derive(Clone)]
pub struct EngineHandle {
    pub(crate) shared: Arc<EngineShared>,
}

impl EngineHandle {
    /// Sends `payload` as a message of the given registered type. The type's flags decide
    ///  checksumming, compression and reliability; `target` and `order` decide where and
    ///  when.
    pub async fn send(
        &self,
        msg_type: MessageType,
        payload: Bytes,
        target: SendTarget,
        order: SendOrder,
    ) -> anyhow::Result<()> {
        match order {
            SendOrder::Immediate => self.send_now(msg_type, &payload, target).await,
            SendOrder::AfterProcessing => {
                self.park(&self.shared.after_processing, msg_type, payload, target)
            }
            SendOrder::NextTick => self.park(&self.shared.next_tick, msg_type, payload, target),
        }
    }

    fn park(
        &self,
        queue: &Mutex<Vec<QueuedSend>>,
        msg_type: MessageType,
        payload: Bytes,
        target: SendTarget,
    ) -> anyhow::Result<()> {
        let flags = self
            .shared
            .registry
            .flags_of(msg_type)
            .ok_or(TransportError::UnknownMessageType(msg_type))?;

        let queued = match target {
            // unreliable single-peer sends can be encoded eagerly, surfacing encode errors
            //  to the caller; everything else is encoded at drain time (reliable messages
            //  get their per-destination ack ids then, broadcasts resolve the peer set then)
            SendTarget::Peer(to) if !flags.needs_ack() => QueuedSend::Encoded {
                bytes: Envelope::encode(msg_type, flags, &payload, None)?,
                to,
            },
            _ => QueuedSend::Typed {
                msg_type,
                payload,
                target,
            },
        };
        queue.lock().unwrap().push(queued);
        Ok(())
    }

    async fn send_now(
        &self,
        msg_type: MessageType,
        payload: &[u8],
        target: SendTarget,
    ) -> anyhow::Result<()> {
        let flags = self
            .shared
            .registry
            .flags_of(msg_type)
            .ok_or(TransportError::UnknownMessageType(msg_type))?;

        let destinations = self.resolve(target);
        if destinations.is_empty() {
            debug!("send of {:?} resolved to no destinations - dropping", msg_type);
            return Ok(());
        }

        if flags.needs_ack() {
            // each destination gets its own ack id so per-peer delivery is tracked
            //  independently even for broadcasts
            for to in destinations {
                let ack_id = self.shared.ack_counter.fetch_add(1, Ordering::Relaxed);
                let bytes = Envelope::encode(msg_type, flags, payload, Some(ack_id))?;
                // registered before the transmission: on loopback the ack can arrive
                //  before send_packet even returns
                self.shared.ack.register_pending(ack_id, to, bytes.clone());
                if let Err(e) = self.shared.send.send_packet(to, &bytes).await {
                    self.shared.ack.discard_pending(ack_id);
                    return Err(e.into());
                }
            }
        } else {
            let bytes = Envelope::encode(msg_type, flags, payload, None)?;
            for to in destinations {
                self.shared.send.send_packet(to, &bytes).await?;
            }
        }
        Ok(())
    }

    fn resolve(&self, target: SendTarget) -> Vec<SocketAddr> {
        match target {
            SendTarget::Peer(addr) => vec![addr],
            SendTarget::Broadcast => self.shared.peers.snapshot(),
            SendTarget::BroadcastExcept(excluded) => self
                .shared
                .peers
                .snapshot()
                .into_iter()
                .filter(|p| *p != excluded)
                .collect(),
        }
    }

    pub(crate) async fn drain_after_processing(&self) {
        self.drain(&self.shared.after_processing).await;
    }

    pub(crate) async fn drain_next_tick(&self) {
        self.drain(&self.shared.next_tick).await;
    }

    /// Flushes a deferred-send queue with the same fan-out policy as batch dispatch:
    ///  concurrent above the parallel threshold, sequential below it.
    async fn drain(&self, queue: &Mutex<Vec<QueuedSend>>) {
        let parked = std::mem::take(&mut *queue.lock().unwrap());
        if parked.len() > self.shared.config.parallel_dispatch_threshold {
            let mut tasks = Vec::with_capacity(parked.len());
            for send in parked {
                let this = self.clone();
                tasks.push(tokio::spawn(async move { this.flush_one(send).await }));
            }
            for task in tasks {
                let _ = task.await;
            }
        } else {
            for send in parked {
                self.flush_one(send).await;
            }
        }
    }

    async fn flush_one(&self, send: QueuedSend) {
        let result = match send {
            QueuedSend::Encoded { bytes, to } => self
                .shared
                .send
                .send_packet(to, &bytes)
                .await
                .map_err(anyhow::Error::from),
            QueuedSend::Typed {
                msg_type,
                payload,
                target,
            } => self.send_now(msg_type, &payload, target).await,
        };
        if let Err(e) = result {
            // isolated per queued send - the rest of the queue still goes out
            tracing::error!("deferred send failed: {:#}", e);
        }
    }

    pub fn add_peer(&self, peer: SocketAddr) {
        self.shared.peers.add(peer);
    }

    pub fn remove_peer(&self, peer: &SocketAddr) -> bool {
        self.shared.peers.remove(peer)
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        self.shared.peers.snapshot()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.send.local_addr()
    }

    /// Datagrams received off the socket, including those later dropped.
    pub fn received_count(&self) -> u64 {
        self.shared.received_count.load(Ordering::Relaxed)
    }

    /// Datagrams fully dispatched through a handler.
    pub fn processed_count(&self) -> u64 {
        self.shared.processed_count.load(Ordering::Relaxed)
    }
}

/// A running peer transport engine: owns the socket and the background tasks. Created with
///  [Engine::start], torn down with [Engine::dispose].
pub struct Engine {
    handle: EngineHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    pub async fn start(
        config: EngineConfig,
        registry: Arc<MessageRegistry>,
        observer: Arc<dyn ConnectionObserver>,
    ) -> anyhow::Result<Engine> {
        config.validate()?;

        let socket = Arc::new(bind_socket(config.bind_addr, config.socket_buffer_bytes)?);
        let send = SendPipeline::new(Arc::new(socket.clone()), config.mtu);
        info!("peer transport engine listening on {:?}", send.local_addr());

        let (cancel, cancel_rx) = watch::channel(false);
        let shared = Arc::new(EngineShared {
            ack: Arc::new(AckManager::new(
                send.clone(),
                observer,
                config.ack_timeout,
                config.max_ack_tries,
                config.seen_ack_window(),
            )),
            send,
            registry,
            peers: PeerRegistry::new(),
            inbound: Arc::new(InboundQueue::new(config.inbound_queue_capacity)),
            after_processing: Mutex::new(Vec::new()),
            next_tick: Mutex::new(Vec::new()),
            ack_counter: AtomicU32::new(0),
            received_count: Arc::new(AtomicU64::new(0)),
            processed_count: Arc::new(AtomicU64::new(0)),
            cancel,
            config,
        });
        let handle = EngineHandle { shared };

        let mut tasks = Vec::new();
        let shared = &handle.shared;

        for _ in 0..shared.config.receive_worker_count {
            tasks.push(tokio::spawn(recv_loop(
                socket.clone(),
                shared.inbound.clone(),
                shared.config.mtu,
                cancel_rx.clone(),
                shared.received_count.clone(),
            )));
        }

        let pipeline = Arc::new(ProcessingPipeline::new(
            shared.registry.clone(),
            shared.ack.clone(),
            shared.send.clone(),
            shared.config.parallel_dispatch_threshold,
            shared.processed_count.clone(),
        ));
        for _ in 0..shared.config.processing_worker_count {
            tasks.push(tokio::spawn(pipeline.clone().process_loop(
                shared.inbound.clone(),
                shared.config.batch_size,
                handle.clone(),
            )));
        }

        tasks.push(tokio::spawn(shared.ack.clone().sweep_loop(
            shared.config.ack_sweep_interval,
            cancel_rx.clone(),
        )));

        if let Some(interval) = shared.config.tick_interval {
            tasks.push(tokio::spawn(tick_loop(
                handle.clone(),
                interval,
                cancel_rx,
            )));
        }

        Ok(Engine {
            handle,
            tasks,
        })
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Stops all background tasks cooperatively and waits for them. The socket is released
    ///  when the last task is gone.
    pub async fn dispose(self) {
        let _ = self.handle.shared.cancel.send(true);
        self.handle.shared.inbound.close();
        for task in self.tasks {
            let _ = task.await;
        }
        info!("peer transport engine shut down");
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::socket::SendSocket;

    /// An [EngineHandle] with no background tasks, backed by whatever [SendSocket] the test
    ///  provides. Lets pipeline and tick tests drive processing by hand.
    pub(crate) fn detached_handle(
        registry: Arc<MessageRegistry>,
        send_socket: Arc<dyn SendSocket>,
        observer: Arc<dyn ConnectionObserver>,
    ) -> EngineHandle {
        let config = EngineConfig::for_addr(SocketAddr::from(([127, 0, 0, 1], 0)));
        let send = SendPipeline::new(send_socket, config.mtu);
        let (cancel, _) = watch::channel(false);

        EngineHandle {
            shared: Arc::new(EngineShared {
                ack: Arc::new(AckManager::new(
                    send.clone(),
                    observer,
                    config.ack_timeout,
                    config.max_ack_tries,
                    config.seen_ack_window(),
                )),
                send,
                registry,
                peers: PeerRegistry::new(),
                inbound: Arc::new(InboundQueue::new(config.inbound_queue_capacity)),
                after_processing: Mutex::new(Vec::new()),
                next_tick: Mutex::new(Vec::new()),
                ack_counter: AtomicU32::new(0),
                received_count: Arc::new(AtomicU64::new(0)),
                processed_count: Arc::new(AtomicU64::new(0)),
                cancel,
                config,
            }),
        }
    }
}
