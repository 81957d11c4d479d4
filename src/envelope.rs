use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Application-registered tag selecting a message's flags and handler. The first two bytes
///  of every envelope on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageType(pub u16);

impl MessageType {
    /// Reserved for the engine's acknowledgement envelope - rejected at registration.
    pub const ACK: MessageType = MessageType(1);

    pub const SERIALIZED_LEN: usize = size_of::<u16>();

    /// Reads the leading type tag without consuming the buffer, so the pipeline can look up
    ///  a message's flags before fully decoding it.
    pub fn peek(raw: &[u8]) -> Option<MessageType> {
        let mut buf = raw;
        buf.try_get_u16().ok().map(MessageType)
    }
}

bitflags! {
    /// Per-type quality-of-service flags, fixed at registration.
    ///
    /// At most one checksum flag and at most one compress flag may be set per type.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnvelopeFlags: u8 {
        /// Adler-32 rolling sum - cheap, weak collision resistance.
        const CHECKSUM_LIGHT  = 1 << 0;
        /// CRC-32 - slower, strong.
        const CHECKSUM_STRONG = 1 << 1;
        /// The message carries an ack id and is retransmitted until acknowledged.
        const NEEDS_ACK       = 1 << 2;
        /// Deflate at the fastest level.
        const COMPRESS_LOW    = 1 << 3;
        /// Deflate at the best level.
        const COMPRESS_HIGH   = 1 << 4;
    }
}

impl EnvelopeFlags {
    pub fn needs_ack(&self) -> bool {
        self.contains(EnvelopeFlags::NEEDS_ACK)
    }

    pub fn has_checksum(&self) -> bool {
        self.intersects(EnvelopeFlags::CHECKSUM_LIGHT | EnvelopeFlags::CHECKSUM_STRONG)
    }

    pub fn has_compression(&self) -> bool {
        self.intersects(EnvelopeFlags::COMPRESS_LOW | EnvelopeFlags::COMPRESS_HIGH)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.contains(EnvelopeFlags::CHECKSUM_LIGHT | EnvelopeFlags::CHECKSUM_STRONG) {
            anyhow::bail!("a message type declares at most one checksum flag");
        }
        if self.contains(EnvelopeFlags::COMPRESS_LOW | EnvelopeFlags::COMPRESS_HIGH) {
            anyhow::bail!("a message type declares at most one compress flag");
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope shorter than its declared fields")]
    Truncated,
    #[error("checksum mismatch in envelope of type {msg_type:?}")]
    ChecksumMismatch {
        msg_type: MessageType,
        /// Still parseable because the checksum never covers the ack id field.
        ack_id: Option<u32>,
    },
    #[error("compressed region could not be inflated")]
    Inflate(#[source] std::io::Error),
    #[error("inflated envelope exceeds {MAX_INFLATED_LEN} bytes")]
    InflatedTooLarge,
}

/// Upper bound on the inflated size of a compressed envelope, guarding against
///  decompression bombs from hostile peers.
pub const MAX_INFLATED_LEN: usize = 64 * 1024;

const CHECKSUM_LEN: usize = size_of::<u32>();
const ACK_ID_LEN: usize = size_of::<u32>();

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// A decoded envelope: type tag, ack id (iff the type needs acknowledgement), payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub msg_type: MessageType,
    pub ack_id: Option<u32>,
    pub payload: Bytes,
}

impl Envelope {
    /// Assembles the wire representation:
    ///  `[type][ack_id if NEEDS_ACK][payload][checksum if checksum flag]`, with everything
    ///  after the type tag deflate-compressed as one region if a compress flag is set.
    ///
    /// The checksum covers the type tag and the payload only - never the ack id, so an
    ///  acknowledgement (or negative acknowledgement) can reference a message whose payload
    ///  arrived corrupted.
    pub fn encode(
        msg_type: MessageType,
        flags: EnvelopeFlags,
        payload: &[u8],
        ack_id: Option<u32>,
    ) -> anyhow::Result<Bytes> {
        if flags.needs_ack() && ack_id.is_none() {
            anyhow::bail!("encoding a NEEDS_ACK envelope without an ack id is a bug");
        }

        let mut buf = BytesMut::with_capacity(
            MessageType::SERIALIZED_LEN + ACK_ID_LEN + payload.len() + CHECKSUM_LEN,
        );
        buf.put_u16(msg_type.0);
        if flags.needs_ack() {
            buf.put_u32(ack_id.unwrap_or_default());
        }
        buf.put_slice(payload);
        if let Some(checksum) = checksum_over(flags, msg_type, payload) {
            buf.put_u32(checksum);
        }

        if !flags.has_compression() {
            return Ok(buf.freeze());
        }

        let level = if flags.contains(EnvelopeFlags::COMPRESS_HIGH) {
            Compression::best()
        } else {
            Compression::fast()
        };

        let mut compressed = Vec::with_capacity(buf.len());
        compressed.extend_from_slice(&buf[..MessageType::SERIALIZED_LEN]);
        let mut encoder = DeflateEncoder::new(compressed, level);
        encoder.write_all(&buf[MessageType::SERIALIZED_LEN..])?;
        Ok(Bytes::from(encoder.finish()?))
    }

    /// Reverses [Envelope::encode]: inflates (if the type declares compression), splits off
    ///  ack id and checksum, and verifies the checksum over the exact region used at encode
    ///  time.
    pub fn decode(raw: &[u8], flags: EnvelopeFlags) -> Result<Envelope, EnvelopeError> {
        let mut buf = raw;
        let msg_type = MessageType(buf.try_get_u16().map_err(|_| EnvelopeError::Truncated)?);

        let inflated;
        let mut body: &[u8] = if flags.has_compression() {
            inflated = inflate_capped(buf)?;
            &inflated
        } else {
            buf
        };

        let ack_id = if flags.needs_ack() {
            Some(body.try_get_u32().map_err(|_| EnvelopeError::Truncated)?)
        } else {
            None
        };

        let payload = if flags.has_checksum() {
            if body.len() < CHECKSUM_LEN {
                return Err(EnvelopeError::Truncated);
            }
            let (payload, mut trailer) = body.split_at(body.len() - CHECKSUM_LEN);
            let declared = trailer.get_u32();
            let computed = checksum_over(flags, msg_type, payload)
                .expect("checksum flag was checked above");
            if declared != computed {
                return Err(EnvelopeError::ChecksumMismatch { msg_type, ack_id });
            }
            payload
        } else {
            body
        };

        Ok(Envelope {
            msg_type,
            ack_id,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

fn inflate_capped(compressed: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let mut inflated = Vec::new();
    let read = DeflateDecoder::new(compressed)
        .take(MAX_INFLATED_LEN as u64 + 1)
        .read_to_end(&mut inflated)
        .map_err(EnvelopeError::Inflate)?;
    if read > MAX_INFLATED_LEN {
        return Err(EnvelopeError::InflatedTooLarge);
    }
    Ok(inflated)
}

fn checksum_over(flags: EnvelopeFlags, msg_type: MessageType, payload: &[u8]) -> Option<u32> {
    if flags.contains(EnvelopeFlags::CHECKSUM_STRONG) {
        let mut digest = CRC32.digest();
        digest.update(&msg_type.0.to_be_bytes());
        digest.update(payload);
        Some(digest.finalize())
    } else if flags.contains(EnvelopeFlags::CHECKSUM_LIGHT) {
        Some(adler32(&msg_type.0.to_be_bytes(), payload))
    } else {
        None
    }
}

/// Adler-32 rolling sum over two concatenated regions.
fn adler32(prefix: &[u8], data: &[u8]) -> u32 {
    const MOD: u32 = 65521;
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for &byte in prefix.iter().chain(data) {
        a = (a + byte as u32) % MOD;
        b = (a + b) % MOD;
    }
    (b << 16) | a
}
