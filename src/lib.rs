//! peerlink is a peer transport engine for real-time multiplayer simulations. It layers
//!  selective per-message reliability, optional compression and a pluggable message-dispatch
//!  protocol on top of a single unreliable UDP socket.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (defined-length chunks of data), each
//!   tagged with an application-registered message type that selects its quality-of-service
//!   flags and its handler
//! * Reliability is opt-in and per-message: a reliable message is retransmitted until its
//!   acknowledgement arrives or a retry budget is exhausted, at which point the peer is
//!   reported lost. There is explicitly *no* TCP-style ordered stream - if the application
//!   needs ordering for some message type, it must layer sequence numbers on top
//! * At-least-once delivery on the wire, at-most-once handler invocation: retransmitted
//!   duplicates are answered from a cache of already-sent acknowledgements without invoking
//!   the handler again
//! * Minimise latency over throughput: messages are never fragmented (payloads must fit the
//!   configured MTU budget), and the socket is tuned for small buffers
//! * Inbound datagrams are drained in batches and dispatched data-parallel when the batch is
//!   big enough to amortise the fan-out overhead
//! * A fixed-period tick loop (with error-feedback drift correction) lets handlers batch
//!   periodic state broadcasts independently of inbound traffic
//!
//! ## Wire format
//!
//! Envelope layout - all numbers in network byte order (BE):
//! ```ascii
//! 0: message type (u16) - application-registered tag, selects flags and handler.
//!     Type 1 is reserved for the engine's acknowledgement envelope.
//! 2: ack id (u32) - present iff the type's flags include NEEDS_ACK. Issued by the sender
//!     from a wrapping counter; referenced by the matching acknowledgement
//! *: payload (N bytes, may be empty)
//! *: checksum (u32) - present iff the type declares CHECKSUM_LIGHT (Adler-32) or
//!     CHECKSUM_STRONG (CRC-32). Covers the type tag and the payload, never the ack id and
//!     never the checksum field itself
//! ```
//!
//! If the type declares COMPRESS_LOW or COMPRESS_HIGH, everything after the leading type tag
//!  (ack id, payload and checksum) is deflate-compressed as a single region after assembly,
//!  so decode inflates before checksum verification.
//!
//! Acknowledgement envelope (message type 1, no flags):
//! ```ascii
//! 0: result (u8): 0 success, 1 failed (handler rejected), 2 failed-corrupted (checksum
//!     mismatch - the sender may resend immediately)
//! 1: ack id (u32) of the reliable message being acknowledged
//! ```
//!
//! ## Concurrency model
//!
//! Four kinds of background task run for the engine's lifetime: N receive workers issuing
//!  concurrent receives on the shared socket, M processing workers draining the shared
//!  inbound queue in batches, one acknowledgement sweep loop, and (if configured) one tick
//!  loop. A single watch-channel cancellation signal stops all of them cooperatively;
//!  disposal joins every task before releasing the socket.

pub mod ack;
pub mod config;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod peers;
pub mod pipeline;
pub mod registry;
pub mod socket;
pub mod tick;
pub mod util;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
