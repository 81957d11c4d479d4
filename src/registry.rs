use crate::engine::EngineHandle;
use crate::envelope::{EnvelopeFlags, MessageType};
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Application-side handler for one message type. Invoked by the processing pipeline with
///  the decoded payload; a returned error is isolated to the one datagram (and answered
///  with a negative acknowledgement if the type is reliable).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_message(
        &self,
        payload: &[u8],
        sender: SocketAddr,
        engine: &EngineHandle,
    ) -> anyhow::Result<()>;
}

/// Handler invoked once per tick of the fixed-period scheduler, independent of inbound
///  traffic. Used e.g. to aggregate many entities' state updates into one outbound datagram
///  per tick instead of one per entity per frame.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TickHandler: Send + Sync + 'static {
    async fn on_tick(&self, elapsed: Duration, engine: &EngineHandle);
}

pub struct MessageDescriptor {
    pub msg_type: MessageType,
    pub flags: EnvelopeFlags,
    pub handler: Arc<dyn MessageHandler>,
}

/// The engine-owned dispatch table: built once at startup by explicit registration calls,
///  immutable afterwards, safe for unsynchronized concurrent lookup.
pub struct MessageRegistry {
    descriptors: FxHashMap<MessageType, MessageDescriptor>,
    tick_handlers: Vec<Arc<dyn TickHandler>>,
}

impl MessageRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            descriptors: FxHashMap::default(),
            tick_handlers: Vec::new(),
        }
    }

    pub fn lookup(&self, msg_type: MessageType) -> Option<&MessageDescriptor> {
        self.descriptors.get(&msg_type)
    }

    pub fn flags_of(&self, msg_type: MessageType) -> Option<EnvelopeFlags> {
        self.descriptors.get(&msg_type).map(|d| d.flags)
    }

    pub fn tick_handlers(&self) -> &[Arc<dyn TickHandler>] {
        &self.tick_handlers
    }
}

pub struct RegistryBuilder {
    descriptors: FxHashMap<MessageType, MessageDescriptor>,
    tick_handlers: Vec<Arc<dyn TickHandler>>,
}

impl RegistryBuilder {
    /// Registers a message type. Fails fast on a duplicate type, a reserved type, or a
    ///  contradictory flag set - registration errors are programming errors and should
    ///  abort startup.
    pub fn register(
        mut self,
        msg_type: MessageType,
        flags: EnvelopeFlags,
        handler: Arc<dyn MessageHandler>,
    ) -> anyhow::Result<Self> {
        if msg_type == MessageType::ACK {
            anyhow::bail!(
                "message type {:?} is reserved for engine acknowledgements",
                msg_type
            );
        }
        flags.validate()?;
        if self.descriptors.contains_key(&msg_type) {
            anyhow::bail!("message type {:?} is already registered", msg_type);
        }

        self.descriptors.insert(
            msg_type,
            MessageDescriptor {
                msg_type,
                flags,
                handler,
            },
        );
        Ok(self)
    }

    pub fn register_tick(mut self, handler: Arc<dyn TickHandler>) -> Self {
        self.tick_handlers.push(handler);
        self
    }

    pub fn build(self) -> MessageRegistry {
        MessageRegistry {
            descriptors: self.descriptors,
            tick_handlers: self.tick_handlers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let registry = MessageRegistry::builder()
            .register(
                MessageType(10),
                EnvelopeFlags::NEEDS_ACK,
                Arc::new(MockMessageHandler::new()),
            )
            .unwrap()
            .register(
                MessageType(11),
                EnvelopeFlags::empty(),
                Arc::new(MockMessageHandler::new()),
            )
            .unwrap()
            .build();

        assert_eq!(registry.flags_of(MessageType(10)), Some(EnvelopeFlags::NEEDS_ACK));
        assert_eq!(registry.flags_of(MessageType(11)), Some(EnvelopeFlags::empty()));
        assert!(registry.lookup(MessageType(12)).is_none());
    }

    #[test]
    fn test_duplicate_type_is_rejected() {
        let result = MessageRegistry::builder()
            .register(
                MessageType(10),
                EnvelopeFlags::empty(),
                Arc::new(MockMessageHandler::new()),
            )
            .unwrap()
            .register(
                MessageType(10),
                EnvelopeFlags::NEEDS_ACK,
                Arc::new(MockMessageHandler::new()),
            );
        assert!(result.is_err());
    }

    #[test]
    fn test_reserved_ack_type_is_rejected() {
        let result = MessageRegistry::builder().register(
            MessageType::ACK,
            EnvelopeFlags::empty(),
            Arc::new(MockMessageHandler::new()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_contradictory_flags_are_rejected() {
        let result = MessageRegistry::builder().register(
            MessageType(10),
            EnvelopeFlags::CHECKSUM_LIGHT.union(EnvelopeFlags::CHECKSUM_STRONG),
            Arc::new(MockMessageHandler::new()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_tick_handlers_are_collected() {
        let registry = MessageRegistry::builder()
            .register_tick(Arc::new(MockTickHandler::new()))
            .register_tick(Arc::new(MockTickHandler::new()))
            .build();
        assert_eq!(registry.tick_handlers().len(), 2);
    }
}
