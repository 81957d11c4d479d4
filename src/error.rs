use crate::envelope::MessageType;

/// Per-datagram and per-send failures. All of these are contained within the processing
///  pipeline or reported to the caller of a send - none of them tears down the engine.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Inbound datagram with a type nobody registered - dropped, non-fatal.
    #[error("no handler registered for message type {0:?}")]
    UnknownMessageType(MessageType),

    /// Checksum mismatch or undecodable envelope - dropped; a negative acknowledgement is
    ///  sent when the message was reliable and the ack id was still parseable.
    #[error("corrupted envelope of type {msg_type:?}")]
    CorruptedEnvelope {
        msg_type: MessageType,
        ack_id: Option<u32>,
    },

    /// A handler returned an error. Isolated to the one datagram, the batch continues.
    #[error("handler for {msg_type:?} failed")]
    HandlerFailure {
        msg_type: MessageType,
        #[source]
        source: anyhow::Error,
    },

    /// The encoded envelope exceeds the MTU budget. Rejected before any socket call -
    ///  peerlink never fragments.
    #[error("encoded envelope of {len} bytes exceeds the MTU budget of {mtu} bytes")]
    SendOverflow { len: usize, mtu: usize },
}
