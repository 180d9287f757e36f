//! Fan-out of server messages to room peers.
//!
//! Each message is encoded once and the same `Arc` buffer is queued on
//! every receiver. Reliable delivery uses the unbounded per-connection
//! queue; volatile delivery uses the bounded one and drops on overflow.
//! Relay never reports delivery results back to the origin.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::protocol::{ConnectionId, ProtocolError, ServerMessage};
use crate::registry::{ConnectionHandle, Delivery, Frame, RoomRegistry};

/// Snapshot of relay counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub frames_queued: u64,
    pub volatile_dropped: u64,
    pub global_updates: u64,
}

/// Lock-free counters; the hot path never takes a lock for stats.
#[derive(Default)]
struct AtomicRelayStats {
    frames_queued: AtomicU64,
    volatile_dropped: AtomicU64,
    global_updates: AtomicU64,
}

/// Routes messages to connections through the room registry.
pub struct BroadcastRelay {
    registry: Arc<RoomRegistry>,
    stats: AtomicRelayStats,
}

impl BroadcastRelay {
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self {
            registry,
            stats: AtomicRelayStats::default(),
        }
    }

    /// Guaranteed delivery to every member of `room_id` except `origin`.
    /// Returns the number of connections the frame was queued on.
    pub async fn relay_reliable(
        &self,
        origin: ConnectionId,
        room_id: &str,
        msg: &ServerMessage,
    ) -> Result<usize, ProtocolError> {
        let frame = Arc::new(msg.encode()?);
        let targets = self.registry.handles_in(room_id, Some(origin)).await;
        Ok(self.deliver(&targets, frame, false))
    }

    /// Best-effort delivery; receivers with a full volatile queue miss it.
    pub async fn relay_volatile(
        &self,
        origin: ConnectionId,
        room_id: &str,
        msg: &ServerMessage,
    ) -> Result<usize, ProtocolError> {
        let frame = Arc::new(msg.encode()?);
        let targets = self.registry.handles_in(room_id, Some(origin)).await;
        Ok(self.deliver(&targets, frame, true))
    }

    /// Reliable delivery to every connection regardless of room. Receivers
    /// filter by the document id embedded in the message.
    pub async fn relay_global_update(
        &self,
        origin: Option<ConnectionId>,
        msg: &ServerMessage,
    ) -> Result<usize, ProtocolError> {
        let frame = Arc::new(msg.encode()?);
        let targets = self.registry.all_handles(origin).await;
        self.stats.global_updates.fetch_add(1, Ordering::Relaxed);
        Ok(self.deliver(&targets, frame, false))
    }

    /// Reliable delivery to a whole room, optionally skipping one member.
    pub async fn notify_room(
        &self,
        room_id: &str,
        except: Option<ConnectionId>,
        msg: &ServerMessage,
    ) -> Result<usize, ProtocolError> {
        let frame = Arc::new(msg.encode()?);
        let targets = self.registry.handles_in(room_id, except).await;
        Ok(self.deliver(&targets, frame, false))
    }

    fn deliver(&self, targets: &[ConnectionHandle], frame: Frame, volatile: bool) -> usize {
        let mut queued = 0;
        for handle in targets {
            let outcome = if volatile {
                handle.send_volatile(frame.clone())
            } else {
                handle.send_reliable(frame.clone())
            };
            match outcome {
                Delivery::Queued => queued += 1,
                Delivery::Dropped => {
                    self.stats.volatile_dropped.fetch_add(1, Ordering::Relaxed);
                    log::trace!("Dropped volatile frame for {}", handle.id());
                }
                Delivery::Closed => {
                    log::debug!("Skipped closed connection {}", handle.id());
                }
            }
        }
        self.stats
            .frames_queued
            .fetch_add(queued as u64, Ordering::Relaxed);
        queued
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            frames_queued: self.stats.frames_queued.load(Ordering::Relaxed),
            volatile_dropped: self.stats.volatile_dropped.load(Ordering::Relaxed),
            global_updates: self.stats.global_updates.load(Ordering::Relaxed),
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionQueues;

    fn edit(bytes: &[u8]) -> ServerMessage {
        ServerMessage::Broadcast {
            payload: bytes.to_vec(),
            iv: vec![0; 12],
        }
    }

    async fn member(registry: &RoomRegistry, room: Option<&str>) -> (ConnectionId, ConnectionQueues) {
        let id = ConnectionId::new();
        let (_, queues) = registry.register(id).await;
        if let Some(room) = room {
            registry.join(id, room).await.unwrap();
        }
        (id, queues)
    }

    #[tokio::test]
    async fn test_reliable_skips_origin() {
        let registry = Arc::new(RoomRegistry::new(4));
        let relay = BroadcastRelay::new(registry.clone());
        let (a, mut qa) = member(&registry, Some("R1")).await;
        let (_b, mut qb) = member(&registry, Some("R1")).await;
        let (_c, mut qc) = member(&registry, Some("R2")).await;

        let count = relay.relay_reliable(a, "R1", &edit(b"hello")).await.unwrap();
        assert_eq!(count, 1);

        let frame = qb.reliable.recv().await.unwrap();
        assert_eq!(ServerMessage::decode(&frame).unwrap(), edit(b"hello"));
        assert!(qa.reliable.try_recv().is_err());
        assert!(qc.reliable.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_volatile_drops_under_backpressure() {
        let registry = Arc::new(RoomRegistry::new(2));
        let relay = BroadcastRelay::new(registry.clone());
        let (a, _qa) = member(&registry, Some("R1")).await;
        let (_b, mut qb) = member(&registry, Some("R1")).await;

        for i in 0..5u8 {
            relay.relay_volatile(a, "R1", &edit(&[i])).await.unwrap();
        }

        let stats = relay.stats();
        assert_eq!(stats.frames_queued, 2);
        assert_eq!(stats.volatile_dropped, 3);

        // The oldest frames survive; later ones were dropped, not queued.
        let first = ServerMessage::decode(&qb.volatile.recv().await.unwrap()).unwrap();
        assert_eq!(first, edit(&[0]));
        let second = ServerMessage::decode(&qb.volatile.recv().await.unwrap()).unwrap();
        assert_eq!(second, edit(&[1]));
        assert!(qb.volatile.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_global_update_ignores_rooms() {
        let registry = Arc::new(RoomRegistry::new(4));
        let relay = BroadcastRelay::new(registry.clone());
        let (a, mut qa) = member(&registry, Some("R1")).await;
        let (_b, mut qb) = member(&registry, None).await;
        let (_c, mut qc) = member(&registry, Some("R9")).await;

        let update = ServerMessage::SnapshotUpdate {
            document_id: "singleton".into(),
            payload: b"{}".to_vec(),
            server_timestamp: 1,
        };
        assert_eq!(relay.relay_global_update(Some(a), &update).await.unwrap(), 2);
        assert!(qb.reliable.recv().await.is_some());
        assert!(qc.reliable.recv().await.is_some());
        assert!(qa.reliable.try_recv().is_err());
        assert_eq!(relay.stats().global_updates, 1);
    }

    #[tokio::test]
    async fn test_notify_room_includes_everyone() {
        let registry = Arc::new(RoomRegistry::new(4));
        let relay = BroadcastRelay::new(registry.clone());
        let (a, mut qa) = member(&registry, Some("R1")).await;
        let (b, mut qb) = member(&registry, Some("R1")).await;

        let mut members = vec![a, b];
        members.sort();
        let msg = ServerMessage::RoomMembership { room_id: "R1".into(), members };
        assert_eq!(relay.notify_room("R1", None, &msg).await.unwrap(), 2);
        assert!(qa.reliable.recv().await.is_some());
        assert!(qb.reliable.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_relay_to_missing_room_is_noop() {
        let registry = Arc::new(RoomRegistry::new(4));
        let relay = BroadcastRelay::new(registry.clone());
        let (a, _qa) = member(&registry, None).await;
        assert_eq!(relay.relay_reliable(a, "nowhere", &edit(b"x")).await.unwrap(), 0);
    }
}
