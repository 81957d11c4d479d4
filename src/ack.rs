use crate::envelope::MessageType;
use crate::socket::SendPipeline;
use crate::util::snapshot_map::SnapshotMap;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// The outcome a receiver reports for one reliable message. Anything but [AckResult::Success]
///  is a negative acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum AckResult {
    /// The message arrived and its handler completed.
    Success = 0,
    /// The message arrived but its handler rejected it. Retransmitting the same bytes will
    ///  not help, so the sender gives up on this message.
    Failed = 1,
    /// The message arrived with a checksum mismatch. The original bytes may well survive a
    ///  second trip, so the sender resends immediately instead of waiting for the timeout.
    FailedCorrupted = 2,
}

/// Assembles a complete acknowledgement envelope (reserved message type, then result byte,
///  then the ack id being answered). Acks are unreliable fire-and-forget: a lost ack is
///  compensated by the peer's retransmission and the seen-ack cache.
pub fn encode_ack(result: AckResult, ack_id: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(MessageType::SERIALIZED_LEN + 5);
    buf.put_u16(MessageType::ACK.0);
    buf.put_u8(result.into());
    buf.put_u32(ack_id);
    buf.freeze()
}

/// Parses an acknowledgement envelope including its leading type tag. Returns `None` for
///  a truncated buffer or an unknown result byte - such an ack is dropped.
pub fn decode_ack(raw: &[u8]) -> Option<(AckResult, u32)> {
    let mut buf = raw;
    let _msg_type = buf.try_get_u16().ok()?;
    let result = AckResult::try_from_primitive(buf.try_get_u8().ok()?).ok()?;
    let ack_id = buf.try_get_u32().ok()?;
    Some((result, ack_id))
}

/// Notified when a peer has exhausted the resend budget for some reliable message. The
///  engine reports and leaves the consequences (e.g. removing the peer) to the application.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionObserver: Send + Sync + 'static {
    async fn on_peer_lost(&self, peer: SocketAddr);
}

#[derive(Clone)]
struct PendingAck {
    to: SocketAddr,
    /// The encoded envelope exactly as first sent, so every retransmission is bit-identical
    ///  and the receiver's duplicate detection by (sender, ack id) holds.
    bytes: Bytes,
    /// Number of retransmissions so far (the initial send is not counted).
    tries: u32,
    last_sent: Instant,
}

/// Bookkeeping for selective reliability.
///
/// Outbound: every reliable send registers here and is retransmitted by [AckManager::sweep]
///  until its ack arrives or the retry budget is exhausted, at which point the destination
///  is reported lost exactly once.
///
/// Inbound: successfully acknowledged message ids are remembered per sender for a recency
///  window, so a retransmitted duplicate is answered from the cache without invoking the
///  handler a second time.
pub struct AckManager {
    send: SendPipeline,
    observer: Arc<dyn ConnectionObserver>,

    pending: SnapshotMap<u32, PendingAck>,
    seen: SnapshotMap<(SocketAddr, u32), Instant>,

    ack_timeout: Duration,
    max_tries: u32,
    seen_window: Duration,
}

impl AckManager {
    pub fn new(
        send: SendPipeline,
        observer: Arc<dyn ConnectionObserver>,
        ack_timeout: Duration,
        max_tries: u32,
        seen_window: Duration,
    ) -> AckManager {
        AckManager {
            send,
            observer,
            pending: SnapshotMap::new(),
            seen: SnapshotMap::new(),
            ack_timeout,
            max_tries,
            seen_window,
        }
    }

    /// Registers a reliable message about to go out for the first time. This runs before
    ///  the transmission so that even an acknowledgement from the fastest possible peer
    ///  finds the record.
    pub fn register_pending(&self, ack_id: u32, to: SocketAddr, bytes: Bytes) {
        let record = PendingAck {
            to,
            bytes,
            tries: 0,
            last_sent: Instant::now(),
        };
        self.pending.update(|pending| {
            pending.insert(ack_id, record);
        });
    }

    /// Drops a pending record without escalation, for reliable sends that failed locally
    ///  before reaching the wire.
    pub fn discard_pending(&self, ack_id: u32) {
        self.pending.remove(&ack_id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.load().len()
    }

    /// Handles an inbound acknowledgement envelope.
    pub async fn on_ack_received(&self, from: SocketAddr, result: AckResult, ack_id: u32) {
        let Some(record) = self.pending.get(&ack_id) else {
            // already acked, already given up on, or a hostile / confused peer
            trace!("ignoring ack {} from {:?} with no pending message", ack_id, from);
            return;
        };

        match result {
            AckResult::Success => {
                trace!("message {} acknowledged by {:?}", ack_id, from);
                self.pending.remove(&ack_id);
            }
            AckResult::Failed => {
                warn!("peer {:?} rejected reliable message {} - giving up on it", from, ack_id);
                self.pending.remove(&ack_id);
            }
            AckResult::FailedCorrupted => {
                debug!("message {} arrived corrupted at {:?} - resending immediately", ack_id, from);
                self.resend_now(ack_id, record).await;
            }
        }
    }

    /// One retransmission outside the regular sweep cadence. Counts against the retry
    ///  budget like any other resend.
    async fn resend_now(&self, ack_id: u32, record: PendingAck) {
        if record.tries >= self.max_tries {
            self.give_up(ack_id, record.to).await;
            return;
        }

        self.pending.update(|pending| {
            if let Some(r) = pending.get_mut(&ack_id) {
                r.tries += 1;
                r.last_sent = Instant::now();
            }
        });
        let _ = self.send.send_packet(record.to, &record.bytes).await;
    }

    async fn give_up(&self, ack_id: u32, to: SocketAddr) {
        // removal decides: the sweep loop and an ack-driven resend can both conclude the
        //  budget is exhausted, but only whoever actually removes the record reports
        if self.pending.remove(&ack_id).is_none() {
            return;
        }
        warn!("no ack for message {} from {:?} after {} tries - reporting peer lost", ack_id, to, self.max_tries);
        self.observer.on_peer_lost(to).await;
    }

    /// Remembers that a reliable message from `from` was handled successfully and its
    ///  positive ack sent, so a retransmitted duplicate is answered without re-dispatch.
    pub fn record_seen(&self, from: SocketAddr, ack_id: u32) {
        let now = Instant::now();
        self.seen.update(|seen| {
            seen.insert((from, ack_id), now);
        });
    }

    /// Checks the seen-ack cache. On a hit the entry's timestamp is refreshed: the peer is
    ///  evidently still retransmitting, so the window starts over.
    pub fn check_seen(&self, from: SocketAddr, ack_id: u32) -> bool {
        if self.seen.get(&(from, ack_id)).is_none() {
            return false;
        }
        self.record_seen(from, ack_id);
        true
    }

    /// One pass over the bookkeeping: resends pending messages whose ack timeout elapsed
    ///  (reporting the destination lost when the budget is exhausted), and evicts seen-ack
    ///  entries older than the recency window.
    pub async fn sweep(&self) {
        let now = Instant::now();

        let mut resends = Vec::new();
        let mut lost = Vec::new();
        for (&ack_id, record) in self.pending.load().iter() {
            if now.duration_since(record.last_sent) < self.ack_timeout {
                continue;
            }
            if record.tries >= self.max_tries {
                lost.push((ack_id, record.to));
            } else {
                resends.push((ack_id, record.to, record.bytes.clone()));
            }
        }

        if !resends.is_empty() {
            self.pending.update(|pending| {
                for &(ack_id, _, _) in &resends {
                    if let Some(r) = pending.get_mut(&ack_id) {
                        r.tries += 1;
                        r.last_sent = now;
                    }
                }
            });
            for (ack_id, to, bytes) in resends {
                trace!("resending unacknowledged message {} to {:?}", ack_id, to);
                let _ = self.send.send_packet(to, &bytes).await;
            }
        }

        for (ack_id, to) in lost {
            self.give_up(ack_id, to).await;
        }

        let expired: Vec<_> = self
            .seen
            .load()
            .iter()
            .filter(|(_, &cached_at)| now.duration_since(cached_at) >= self.seen_window)
            .map(|(key, _)| *key)
            .collect();
        if !expired.is_empty() {
            self.seen.update(|seen| {
                for key in &expired {
                    seen.remove(key);
                }
            });
        }
    }

    /// The background sweep task: runs [AckManager::sweep] at a fixed period until cancelled.
    pub async fn sweep_loop(self: Arc<Self>, interval: Duration, mut cancelled: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = cancelled.changed() => break,
                _ = tokio::time::sleep(interval) => {
                    self.sweep().await;
                }
            }
        }
        trace!("ack sweep loop shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::MockSendSocket;
    use mockall::predicate::eq;
    use rstest::*;
    use tokio::runtime::Builder;
    use tokio::time::advance;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn manager(
        send_socket: MockSendSocket,
        observer: MockConnectionObserver,
        max_tries: u32,
    ) -> AckManager {
        AckManager::new(
            SendPipeline::new(Arc::new(send_socket), 1400),
            Arc::new(observer),
            Duration::from_millis(100),
            max_tries,
            Duration::from_millis(500),
        )
    }

    fn paused_rt() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
    }

    #[rstest]
    #[case::success(AckResult::Success, 0)]
    #[case::failed(AckResult::Failed, 1)]
    #[case::failed_corrupted(AckResult::FailedCorrupted, 2)]
    fn test_ack_codec(#[case] result: AckResult, #[case] expected_byte: u8) {
        let raw = encode_ack(result, 0x01020304);
        assert_eq!(raw.as_ref(), &[0, 1, expected_byte, 1, 2, 3, 4]);
        assert_eq!(decode_ack(&raw), Some((result, 0x01020304)));
    }

    #[rstest]
    #[case::unknown_result(vec![0, 1, 9, 0, 0, 0, 1])]
    #[case::truncated_id(vec![0, 1, 0, 0, 0])]
    #[case::empty(vec![])]
    fn test_malformed_ack_is_rejected(#[case] raw: Vec<u8>) {
        assert_eq!(decode_ack(&raw), None);
    }

    #[test]
    fn test_success_ack_clears_pending() {
        let mut send_socket = MockSendSocket::new();
        send_socket.expect_do_send_packet().never();
        let mut observer = MockConnectionObserver::new();
        observer.expect_on_peer_lost().never();

        let manager = manager(send_socket, observer, 3);

        paused_rt().block_on(async {
            manager.register_pending(7, addr(1), Bytes::from_static(&[1, 2]));
            assert_eq!(manager.pending_count(), 1);

            manager.on_ack_received(addr(1), AckResult::Success, 7).await;
            assert_eq!(manager.pending_count(), 0);

            // a late sweep must not resend
            advance(Duration::from_millis(200)).await;
            manager.sweep().await;
        });
    }

    #[test]
    fn test_failed_ack_gives_up_without_resend() {
        let mut send_socket = MockSendSocket::new();
        send_socket.expect_do_send_packet().never();
        let observer = MockConnectionObserver::new();

        let manager = manager(send_socket, observer, 3);

        paused_rt().block_on(async {
            manager.register_pending(7, addr(1), Bytes::from_static(&[1, 2]));
            manager.on_ack_received(addr(1), AckResult::Failed, 7).await;
            assert_eq!(manager.pending_count(), 0);
        });
    }

    #[test]
    fn test_failed_corrupted_resends_immediately() {
        let mut send_socket = MockSendSocket::new();
        send_socket
            .expect_do_send_packet()
            .once()
            .withf(|to, bytes| *to == addr(1) && bytes == [1u8, 2])
            .return_const(());
        let observer = MockConnectionObserver::new();

        let manager = manager(send_socket, observer, 3);

        paused_rt().block_on(async {
            manager.register_pending(7, addr(1), Bytes::from_static(&[1, 2]));
            manager.on_ack_received(addr(1), AckResult::FailedCorrupted, 7).await;

            // still pending and the timeout restarted with the resend
            assert_eq!(manager.pending_count(), 1);
            manager.sweep().await;
        });
    }

    #[test]
    fn test_sweep_resends_after_timeout_only() {
        let mut send_socket = MockSendSocket::new();
        send_socket
            .expect_do_send_packet()
            .once()
            .withf(|to, bytes| *to == addr(1) && bytes == [5u8])
            .return_const(());
        let observer = MockConnectionObserver::new();

        let manager = manager(send_socket, observer, 3);

        paused_rt().block_on(async {
            manager.register_pending(9, addr(1), Bytes::from_static(&[5]));

            advance(Duration::from_millis(50)).await;
            manager.sweep().await; // before the timeout: no resend

            advance(Duration::from_millis(60)).await;
            manager.sweep().await; // past the timeout: exactly one resend
        });
    }

    #[test]
    fn test_retry_exhaustion_reports_peer_lost_exactly_once() {
        const MAX_TRIES: u32 = 3;

        let mut send_socket = MockSendSocket::new();
        send_socket
            .expect_do_send_packet()
            .times(MAX_TRIES as usize)
            .return_const(());
        let mut observer = MockConnectionObserver::new();
        observer
            .expect_on_peer_lost()
            .once()
            .with(eq(addr(4)))
            .return_const(());

        let manager = manager(send_socket, observer, MAX_TRIES);

        paused_rt().block_on(async {
            manager.register_pending(1, addr(4), Bytes::from_static(&[1]));

            for _ in 0..MAX_TRIES + 3 {
                advance(Duration::from_millis(150)).await;
                manager.sweep().await;
            }
            assert_eq!(manager.pending_count(), 0);
        });
    }

    #[test]
    fn test_racing_exhaustion_paths_report_peer_lost_once() {
        let mut send_socket = MockSendSocket::new();
        send_socket.expect_do_send_packet().never();
        let mut observer = MockConnectionObserver::new();
        observer
            .expect_on_peer_lost()
            .once()
            .with(eq(addr(4)))
            .return_const(());

        let manager = manager(send_socket, observer, 3);

        paused_rt().block_on(async {
            manager.register_pending(1, addr(4), Bytes::from_static(&[1]));

            // the sweep loop and an ack-driven resend can both conclude the budget is
            //  exhausted for the same record; only the one that removes it may report
            manager.give_up(1, addr(4)).await;
            manager.give_up(1, addr(4)).await;
            assert_eq!(manager.pending_count(), 0);
        });
    }

    #[test]
    fn test_seen_cache_hit_and_expiry() {
        let send_socket = MockSendSocket::new();
        let observer = MockConnectionObserver::new();
        let manager = manager(send_socket, observer, 3);

        paused_rt().block_on(async {
            assert!(!manager.check_seen(addr(1), 42));

            manager.record_seen(addr(1), 42);
            assert!(manager.check_seen(addr(1), 42));
            assert!(!manager.check_seen(addr(2), 42)); // keyed per sender
            assert!(!manager.check_seen(addr(1), 43));

            // expires only once the recency window passes without a refresh
            advance(Duration::from_millis(400)).await;
            manager.sweep().await;
            assert!(manager.check_seen(addr(1), 42)); // refreshed by the hit above

            advance(Duration::from_millis(600)).await;
            manager.sweep().await;
            assert!(!manager.check_seen(addr(1), 42));
        });
    }

    #[test]
    fn test_ack_for_unknown_id_is_ignored() {
        let send_socket = MockSendSocket::new();
        let mut observer = MockConnectionObserver::new();
        observer.expect_on_peer_lost().never();
        let manager = manager(send_socket, observer, 3);

        paused_rt().block_on(async {
            manager.on_ack_received(addr(1), AckResult::Success, 999).await;
            manager.on_ack_received(addr(1), AckResult::FailedCorrupted, 999).await;
        });
    }
}
