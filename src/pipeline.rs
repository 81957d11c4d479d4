use crate::ack::{decode_ack, encode_ack, AckManager, AckResult};
use crate::engine::EngineHandle;
use crate::envelope::{Envelope, EnvelopeError, MessageType};
use crate::error::TransportError;
use crate::registry::MessageRegistry;
use crate::socket::{InboundDatagram, InboundQueue, SendPipeline};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, trace, warn};

/// The inbound half of the engine: decodes datagrams, answers acknowledgements, suppresses
///  duplicates and dispatches to the registered handlers. Several workers run
///  [ProcessingPipeline::process_loop] against the shared inbound queue.
pub struct ProcessingPipeline {
    registry: Arc<MessageRegistry>,
    ack: Arc<AckManager>,
    send: SendPipeline,
    parallel_threshold: usize,
    processed_count: Arc<AtomicU64>,
}

impl ProcessingPipeline {
    pub fn new(
        registry: Arc<MessageRegistry>,
        ack: Arc<AckManager>,
        send: SendPipeline,
        parallel_threshold: usize,
        processed_count: Arc<AtomicU64>,
    ) -> ProcessingPipeline {
        ProcessingPipeline {
            registry,
            ack,
            send,
            parallel_threshold,
            processed_count,
        }
    }

    /// One processing worker: drains batches off the inbound queue until it is closed,
    ///  flushing deferred sends after each batch.
    pub async fn process_loop(
        self: Arc<Self>,
        queue: Arc<InboundQueue>,
        batch_size: usize,
        engine: EngineHandle,
    ) {
        while let Some(batch) = queue.next_batch(batch_size).await {
            self.clone().process_batch(batch, &engine).await;
            engine.drain_after_processing().await;
        }
        trace!("processing worker shutting down");
    }

    /// Dispatches one batch, data-parallel when it is big enough to amortise the task
    ///  fan-out. Datagrams within a batch carry no ordering guarantee either way - UDP
    ///  already reorders freely.
    pub async fn process_batch(self: Arc<Self>, batch: Vec<InboundDatagram>, engine: &EngineHandle) {
        if batch.len() > self.parallel_threshold {
            let mut tasks = Vec::with_capacity(batch.len());
            for datagram in batch {
                let this = self.clone();
                let engine = engine.clone();
                tasks.push(tokio::spawn(async move {
                    this.process_datagram(datagram, &engine).await;
                }));
            }
            for task in tasks {
                let _ = task.await;
            }
        } else {
            for datagram in batch {
                self.process_datagram(datagram, engine).await;
            }
        }
    }

    /// The per-datagram pipeline: peek type, route acks, decode, suppress duplicates,
    ///  dispatch. Every failure is contained to this one datagram.
    pub async fn process_datagram(&self, datagram: InboundDatagram, engine: &EngineHandle) {
        let from = datagram.from;

        let Some(msg_type) = MessageType::peek(&datagram.bytes) else {
            warn!("dropping datagram from {:?} too short for a type tag", from);
            return;
        };

        if msg_type == MessageType::ACK {
            match decode_ack(&datagram.bytes) {
                Some((result, ack_id)) => self.ack.on_ack_received(from, result, ack_id).await,
                None => warn!("dropping malformed acknowledgement from {:?}", from),
            }
            return;
        }

        let Some(descriptor) = self.registry.lookup(msg_type) else {
            warn!("{}", TransportError::UnknownMessageType(msg_type));
            return;
        };

        let envelope = match Envelope::decode(&datagram.bytes, descriptor.flags) {
            Ok(envelope) => envelope,
            Err(EnvelopeError::ChecksumMismatch { msg_type, ack_id }) => {
                warn!("{}", TransportError::CorruptedEnvelope { msg_type, ack_id });
                // the ack id field is not covered by the checksum, so when it parsed we
                //  can ask the sender for an immediate resend
                if let Some(ack_id) = ack_id {
                    let _ = self
                        .send
                        .send_packet(from, &encode_ack(AckResult::FailedCorrupted, ack_id))
                        .await;
                }
                return;
            }
            Err(e) => {
                warn!("dropping undecodable envelope of type {:?} from {:?}: {}", msg_type, from, e);
                return;
            }
        };

        if let Some(ack_id) = envelope.ack_id {
            if self.ack.check_seen(from, ack_id) {
                trace!("duplicate of already-handled message {} from {:?} - re-acking", ack_id, from);
                let _ = self
                    .send
                    .send_packet(from, &encode_ack(AckResult::Success, ack_id))
                    .await;
                return;
            }
        }

        match descriptor
            .handler
            .on_message(&envelope.payload, from, engine)
            .await
        {
            Ok(()) => {
                if let Some(ack_id) = envelope.ack_id {
                    self.ack.record_seen(from, ack_id);
                    let _ = self
                        .send
                        .send_packet(from, &encode_ack(AckResult::Success, ack_id))
                        .await;
                }
                self.processed_count.fetch_add(1, Ordering::Relaxed);
            }
            Err(source) => {
                error!("{:#}", anyhow::Error::from(TransportError::HandlerFailure { msg_type, source }));
                // not cached: if the peer resends anyway, the handler gets another chance
                if let Some(ack_id) = envelope.ack_id {
                    let _ = self
                        .send
                        .send_packet(from, &encode_ack(AckResult::Failed, ack_id))
                        .await;
                }
            }
        }
    }
}
