#![forbid(unsafe_code)]

use super::RoomManager;
use crate::signaling::protocol::ServerMessage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Per-room settings, shared by everyone in the room
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSettings {
    /// Keep the room (chat, start time, settings) after the last participant leaves
    pub persist_after_empty: bool,
}

/// Partial update; absent fields are left alone
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    #[serde(default)]
    pub persist_after_empty: Option<bool>,
}

impl RoomSettings {
    pub fn apply(&mut self, patch: &SettingsPatch) {
        if let Some(persist) = patch.persist_after_empty {
            self.persist_after_empty = persist;
        }
    }
}

impl RoomManager {
    /// Merges a settings patch (last write wins) and broadcasts the result to the
    /// whole room, updater included. Returns false for a stale room or requester.
    pub async fn update_settings(&self, room_id: &str, requester_id: &str, patch: SettingsPatch) -> bool {
        let Some(room_lock) = self.get_room(room_id) else {
            debug!("update_settings: room {} not found", room_id);
            return false;
        };
        let mut room = room_lock.write().await;
        if !room.is_member(requester_id) {
            debug!("update_settings: {} is not in room {}", requester_id, room_id);
            return false;
        }

        room.settings.apply(&patch);
        let settings = room.settings.clone();
        info!("Room settings updated for room {} by {}: {:?}", room_id, requester_id, settings);
        room.broadcast_all(&ServerMessage::RoomSettingsUpdated { settings });
        self.settle(&room_lock, &mut room);
        true
    }
}
