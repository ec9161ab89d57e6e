#![forbid(unsafe_code)]

// Presence - media status toggles and remote suppression

use super::{ParticipantStatus, RoomManager};
use crate::signaling::protocol::ServerMessage;
use tracing::{debug, info};

/// One of the four status flags a participant carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFlag {
    Muted,
    CameraOff,
    ScreenSharing,
    HandRaised,
}

impl StatusFlag {
    fn set(self, status: &mut ParticipantStatus, value: bool) {
        match self {
            Self::Muted => status.is_muted = value,
            Self::CameraOff => status.is_camera_off = value,
            Self::ScreenSharing => status.is_screen_sharing = value,
            Self::HandRaised => status.is_hand_raised = value,
        }
    }

    fn toggled_event(self, id: String, value: bool) -> ServerMessage {
        match self {
            Self::Muted => ServerMessage::UserToggledMute { id, is_muted: value },
            Self::CameraOff => ServerMessage::UserToggledCamera { id, is_camera_off: value },
            Self::ScreenSharing => ServerMessage::UserToggledScreenShare { id, is_screen_sharing: value },
            Self::HandRaised => ServerMessage::UserToggledHandRaise { id, is_hand_raised: value },
        }
    }
}

/// Flags another participant can switch off remotely
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForcedFlag {
    Mute,
    CameraOff,
}

impl ForcedFlag {
    fn status_flag(self) -> StatusFlag {
        match self {
            Self::Mute => StatusFlag::Muted,
            Self::CameraOff => StatusFlag::CameraOff,
        }
    }

    fn notice(self, by: String) -> ServerMessage {
        match self {
            Self::Mute => ServerMessage::ForceMute { by },
            Self::CameraOff => ServerMessage::ForceCameraOff { by },
        }
    }
}

impl RoomManager {
    /// Sets one of the participant's own flags and tells everyone else.
    /// Returns false for a stale room or participant.
    pub async fn set_status(&self, room_id: &str, participant_id: &str, flag: StatusFlag, value: bool) -> bool {
        let Some(room_lock) = self.get_room(room_id) else {
            debug!("{:?} toggle: room {} not found", flag, room_id);
            return false;
        };
        let mut room = room_lock.write().await;
        let Some(participant) = room.participants.get_mut(participant_id) else {
            debug!("{:?} toggle: {} is not in room {}", flag, participant_id, room_id);
            return false;
        };
        flag.set(&mut participant.status, value);

        room.broadcast_except(participant_id, &flag.toggled_event(participant_id.to_string(), value));
        self.settle(&room_lock, &mut room);
        true
    }

    pub async fn set_muted(&self, room_id: &str, participant_id: &str, is_muted: bool) -> bool {
        self.set_status(room_id, participant_id, StatusFlag::Muted, is_muted).await
    }

    pub async fn set_camera_off(&self, room_id: &str, participant_id: &str, is_camera_off: bool) -> bool {
        self.set_status(room_id, participant_id, StatusFlag::CameraOff, is_camera_off).await
    }

    pub async fn set_screen_sharing(&self, room_id: &str, participant_id: &str, is_screen_sharing: bool) -> bool {
        self.set_status(room_id, participant_id, StatusFlag::ScreenSharing, is_screen_sharing).await
    }

    pub async fn set_hand_raised(&self, room_id: &str, participant_id: &str, is_hand_raised: bool) -> bool {
        self.set_status(room_id, participant_id, StatusFlag::HandRaised, is_hand_raised).await
    }

    /// Switches a flag on for someone else. The target gets a `force-*` notice and the
    /// whole room sees the resulting toggle. Only the target can switch it back.
    pub async fn force(&self, room_id: &str, requester_id: &str, target_id: &str, forced: ForcedFlag) -> bool {
        let Some(room_lock) = self.get_room(room_id) else {
            debug!("force {:?}: room {} not found", forced, room_id);
            return false;
        };
        let mut room = room_lock.write().await;
        if !room.is_member(requester_id) {
            debug!("force {:?}: requester {} is not in room {}", forced, requester_id, room_id);
            return false;
        }
        let flag = forced.status_flag();
        let Some(target) = room.participants.get_mut(target_id) else {
            debug!("force {:?}: target {} is not in room {}", forced, target_id, room_id);
            return false;
        };
        flag.set(&mut target.status, true);

        room.send_to(target_id, &forced.notice(requester_id.to_string()));
        room.broadcast_all(&flag.toggled_event(target_id.to_string(), true));
        self.settle(&room_lock, &mut room);

        info!("{} forced {:?} on {} in room {}", requester_id, forced, target_id, room_id);
        true
    }

    pub async fn force_mute(&self, room_id: &str, requester_id: &str, target_id: &str) -> bool {
        self.force(room_id, requester_id, target_id, ForcedFlag::Mute).await
    }

    pub async fn force_camera_off(&self, room_id: &str, requester_id: &str, target_id: &str) -> bool {
        self.force(room_id, requester_id, target_id, ForcedFlag::CameraOff).await
    }
}
