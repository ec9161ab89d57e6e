#![forbid(unsafe_code)]

// Live connections, keyed by connection id, with the room each one is in.

use super::protocol::FrameSender;
use crate::room::RoomManager;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tracing::{debug, info};
use uuid::Uuid;

struct ConnectionEntry {
    sender: FrameSender,
    room_id: Option<String>,
}

/// Shared map of live connections. The std lock is only held for map access.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<StdRwLock<HashMap<String, ConnectionEntry>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new connection and returns its freshly generated id
    pub fn connect(&self, sender: FrameSender) -> String {
        let id = Uuid::new_v4().to_string();
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.insert(id.clone(), ConnectionEntry { sender, room_id: None });
        id
    }

    pub fn sender_for(&self, id: &str) -> Option<FrameSender> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(id).map(|entry| entry.sender.clone())
    }

    pub fn room_of(&self, id: &str) -> Option<String> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(id).and_then(|entry| entry.room_id.clone())
    }

    pub fn set_room(&self, id: &str, room_id: Option<String>) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = map.get_mut(id) {
            entry.room_id = room_id;
        }
    }

    /// Forgets a connection and removes it from its room. A second call is a no-op.
    pub async fn disconnect(&self, id: &str, rooms: &RoomManager) -> bool {
        let entry = {
            let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
            map.remove(id)
        };
        let Some(entry) = entry else {
            debug!("disconnect: connection {} already gone", id);
            return false;
        };

        if let Some(room_id) = entry.room_id {
            info!("Connection {} disconnected from room {}", id, room_id);
            rooms.leave_room(&room_id, id).await;
        }
        true
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoomLimits;
    use crate::metrics::ServerMetrics;
    use crate::room::ParticipantStatus;
    use tokio::sync::mpsc;

    #[test]
    fn test_connect_assigns_unique_ids() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        let a = registry.connect(tx.clone());
        let b = registry.connect(tx);
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert!(registry.sender_for(&a).is_some());
        assert!(registry.sender_for("nope").is_none());
        assert!(registry.room_of(&a).is_none());
    }

    #[tokio::test]
    async fn test_disconnect_leaves_room_and_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let rooms = RoomManager::new(RoomLimits::default(), ServerMetrics::new());

        let (tx_a, _rx_a) = mpsc::channel(64);
        let a = registry.connect(tx_a.clone());
        rooms.join_room("r1", &a, "Alice", ParticipantStatus::default(), tx_a.into()).await.unwrap();
        registry.set_room(&a, Some("r1".to_string()));

        let (tx_b, mut rx_b) = mpsc::channel(64);
        let b = registry.connect(tx_b.clone());
        rooms.join_room("r1", &b, "Bob", ParticipantStatus::default(), tx_b.into()).await.unwrap();
        registry.set_room(&b, Some("r1".to_string()));
        while rx_b.try_recv().is_ok() {}

        assert!(registry.disconnect(&a, &rooms).await);
        assert!(!registry.disconnect(&a, &rooms).await);
        assert_eq!(registry.len(), 1);
        assert_eq!(rooms.participant_count_for_room("r1"), 1);

        let frame: serde_json::Value = serde_json::from_str(&rx_b.try_recv().unwrap()).unwrap();
        assert_eq!(frame["type"], "user-left");
        assert_eq!(frame["id"], a.as_str());
        assert!(rx_b.try_recv().is_err());

        assert!(registry.disconnect(&b, &rooms).await);
        assert!(!rooms.has_room("r1"));
        assert!(registry.is_empty());
    }
}
