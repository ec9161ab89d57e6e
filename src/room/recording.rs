#![forbid(unsafe_code)]

// Recording coordination. The capture itself happens in a browser; the server only
// keeps everyone's view of "is this room being recorded, since when, by whom" in sync.

use super::RoomManager;
use crate::signaling::protocol::ServerMessage;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

/// An active recording. At most one per room.
#[derive(Debug, Clone)]
pub struct RecordingSession {
    pub started_at: DateTime<Utc>,
    pub initiator: String,
}

/// Wire form of a room's recording state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingState {
    pub active: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub initiator: Option<String>,
}

impl From<Option<&RecordingSession>> for RecordingState {
    fn from(session: Option<&RecordingSession>) -> Self {
        match session {
            Some(s) => Self {
                active: true,
                start_time: Some(s.started_at),
                initiator: Some(s.initiator.clone()),
            },
            None => Self::default(),
        }
    }
}

impl RoomManager {
    /// Idle -> Recording. A no-op while a recording is already running, so the first
    /// requester stays the initiator.
    pub async fn start_recording(&self, room_id: &str, requester_id: &str) -> bool {
        let Some(room_lock) = self.get_room(room_id) else {
            debug!("start_recording: room {} not found", room_id);
            return false;
        };
        let mut room = room_lock.write().await;
        if !room.is_member(requester_id) {
            debug!("start_recording: {} is not in room {}", requester_id, room_id);
            return false;
        }
        if room.recording.is_some() {
            debug!("start_recording: room {} is already recording", room_id);
            return false;
        }

        room.recording = Some(RecordingSession {
            started_at: Utc::now(),
            initiator: requester_id.to_string(),
        });
        self.metrics.inc_recordings_started();
        info!("Recording started in room {} by {}", room_id, requester_id);

        let recording = room.recording_state();
        room.broadcast_all(&ServerMessage::RecordingStateUpdated { recording });
        self.settle(&room_lock, &mut room);
        true
    }

    /// Recording -> Idle. Any participant may stop it.
    pub async fn stop_recording(&self, room_id: &str, requester_id: &str) -> bool {
        let Some(room_lock) = self.get_room(room_id) else {
            debug!("stop_recording: room {} not found", room_id);
            return false;
        };
        let mut room = room_lock.write().await;
        if !room.is_member(requester_id) {
            debug!("stop_recording: {} is not in room {}", requester_id, room_id);
            return false;
        }
        if room.recording.take().is_none() {
            debug!("stop_recording: room {} is not recording", room_id);
            return false;
        }

        info!("Recording stopped in room {} by {}", room_id, requester_id);
        let recording = room.recording_state();
        room.broadcast_all(&ServerMessage::RecordingStateUpdated { recording });
        self.settle(&room_lock, &mut room);
        true
    }
}
