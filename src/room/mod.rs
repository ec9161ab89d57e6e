#![forbid(unsafe_code)]

// Room module - Room state management and participant tracking
pub mod chat;
pub mod presence;
pub mod recording;
pub mod settings;

use crate::config::RoomLimits;
use crate::metrics::ServerMetrics;
use crate::signaling::protocol::{try_deliver, ClientHandle, Delivery, ServerMessage};
use anyhow::Result;
use chat::{ChatMessage, MessageLog};
use chrono::{DateTime, Utc};
use recording::{RecordingSession, RecordingState};
use serde::Serialize;
use settings::RoomSettings;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::RwLock as TokioRwLock;
use tracing::{debug, info, warn};

/// Media status flags a participant advertises to the room
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantStatus {
    pub is_muted: bool,
    pub is_camera_off: bool,
    pub is_screen_sharing: bool,
    pub is_hand_raised: bool,
}

/// Participant in a room
#[derive(Clone)]
pub struct Participant {
    pub id: String,
    pub name: String,
    pub client: ClientHandle,
    pub status: ParticipantStatus,
}

/// Roster entry sent to a new joiner
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub id: String,
    pub user_name: String,
    #[serde(flatten)]
    pub status: ParticipantStatus,
}

impl From<&Participant> for ParticipantInfo {
    fn from(p: &Participant) -> Self {
        Self {
            id: p.id.clone(),
            user_name: p.name.clone(),
            status: p.status,
        }
    }
}

/// What a joiner was shown, in delivery order
#[derive(Debug, Clone)]
pub struct JoinSnapshot {
    pub is_new_room: bool,
    /// Everyone except the joiner
    pub participants: Vec<ParticipantInfo>,
    /// Public messages only
    pub history: Vec<ChatMessage>,
    pub settings: RoomSettings,
    pub started_at: DateTime<Utc>,
    pub recording: RecordingState,
}

/// Room state
pub struct Room {
    pub id: String,
    pub participants: HashMap<String, Participant>,
    pub(crate) messages: MessageLog,
    pub settings: RoomSettings,
    pub started_at: DateTime<Utc>,
    pub(crate) recording: Option<RecordingSession>,
    /// Set under this room's lock just before the room leaves the store.
    /// A joiner holding a stale handle must go back to the store.
    closed: bool,
    /// Members whose queue overflowed during this operation's fan-out
    lagging: Vec<String>,
    metrics: ServerMetrics,
}

impl Room {
    fn new(id: String, limits: &RoomLimits, metrics: ServerMetrics) -> Self {
        Self {
            id,
            participants: HashMap::new(),
            messages: MessageLog::new(limits.max_messages_per_room),
            settings: RoomSettings::default(),
            started_at: Utc::now(),
            recording: None,
            closed: false,
            lagging: Vec::new(),
            metrics,
        }
    }

    fn encode(&self, message: &ServerMessage) -> Option<Arc<String>> {
        match message.encode() {
            Ok(json) => Some(json),
            Err(e) => {
                warn!("Failed to serialize message for room {}: {}", self.id, e);
                None
            }
        }
    }

    /// Queues `json` for every member `include` accepts. A member whose queue is full
    /// has missed a room event and is marked for eviction.
    fn fan_out(&mut self, json: &Arc<String>, include: impl Fn(&str) -> bool) {
        for (id, participant) in &self.participants {
            if !include(id) {
                continue;
            }
            if try_deliver(&participant.client.frames, json.clone(), id, &self.metrics) == Delivery::Full
                && !self.lagging.contains(id)
            {
                self.lagging.push(id.clone());
            }
        }
    }

    /// Broadcast a message to all participants except the sender
    pub(crate) fn broadcast_except(&mut self, sender_id: &str, message: &ServerMessage) {
        let Some(json) = self.encode(message) else { return };
        self.fan_out(&json, |id| id != sender_id);
    }

    /// Send a message to a specific participant
    pub(crate) fn send_to(&mut self, participant_id: &str, message: &ServerMessage) {
        self.send_to_each(&[participant_id], message);
    }

    /// Send one message to a handful of participants, serialized once
    pub(crate) fn send_to_each(&mut self, participant_ids: &[&str], message: &ServerMessage) {
        let Some(json) = self.encode(message) else { return };
        self.fan_out(&json, |id| participant_ids.contains(&id));
    }

    /// Broadcast a message to all participants
    pub(crate) fn broadcast_all(&mut self, message: &ServerMessage) {
        let Some(json) = self.encode(message) else { return };
        self.fan_out(&json, |_| true);
    }

    /// Takes a participant out and tells the rest. Stops a recording it started.
    fn remove_participant(&mut self, participant_id: &str) -> Option<Participant> {
        let participant = self.participants.remove(participant_id)?;
        self.broadcast_all(&ServerMessage::UserLeft {
            id: participant_id.to_string(),
        });

        if self.recording.as_ref().is_some_and(|s| s.initiator == participant_id) {
            self.recording = None;
            info!("Recording in room {} stopped: initiator {} left", self.id, participant_id);
            let recording = self.recording_state();
            self.broadcast_all(&ServerMessage::RecordingStateUpdated { recording });
        }
        Some(participant)
    }

    /// Drops members that fell behind and closes their connections. Their clients
    /// rejoin and get a fresh snapshot; everyone else sees an ordinary leave.
    fn evict_lagging(&mut self) {
        while let Some(id) = self.lagging.pop() {
            let Some(participant) = self.remove_participant(&id) else {
                continue;
            };
            warn!("Participant {} fell behind in room {}, closing its connection", id, self.id);
            participant.client.close();
            self.metrics.inc_members_evicted();
            self.metrics.inc_leaves();
        }
    }

    pub(crate) fn recording_state(&self) -> RecordingState {
        RecordingState::from(self.recording.as_ref())
    }

    fn is_member(&self, participant_id: &str) -> bool {
        self.participants.contains_key(participant_id)
    }
}

/// Name shown for a participant who did not pick one
fn display_name(requested: &str, participant_id: &str) -> String {
    let trimmed = requested.trim();
    if trimmed.is_empty() {
        let prefix: String = participant_id.chars().take(4).collect();
        format!("User {prefix}")
    } else {
        trimmed.to_string()
    }
}

/// Owns every room.
///
/// Uses per-room locking: the outer HashMap is protected by a std::sync::RwLock
/// (held only for brief lookups/inserts, never across await points), while each
/// room is protected by its own tokio::sync::RwLock. Every mutation of a room runs
/// under that room's write lock, so operations on one room are totally ordered.
/// Lock order is room then map; the map lock is never held while awaiting a room.
pub struct RoomManager {
    rooms: Arc<StdRwLock<HashMap<String, Arc<TokioRwLock<Room>>>>>,
    limits: RoomLimits,
    metrics: ServerMetrics,
}

impl RoomManager {
    pub fn new(limits: RoomLimits, metrics: ServerMetrics) -> Self {
        Self {
            rooms: Arc::new(StdRwLock::new(HashMap::new())),
            limits,
            metrics,
        }
    }

    /// Gets a room lock by ID (brief outer read lock, no await)
    fn get_room(&self, room_id: &str) -> Option<Arc<TokioRwLock<Room>>> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.get(room_id).cloned()
    }

    /// Gets or creates a room. The bool is true when the room was created here.
    fn get_or_create_room(&self, room_id: &str) -> Result<(Arc<TokioRwLock<Room>>, bool)> {
        // Fast path: room exists (brief outer read lock)
        if let Some(room) = self.get_room(room_id) {
            return Ok((room, false));
        }

        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        // Re-check under write lock (handles concurrent creation)
        if let Some(existing) = rooms.get(room_id) {
            return Ok((existing.clone(), false));
        }

        if rooms.len() >= self.limits.max_rooms && !self.evict_oldest_empty(&mut rooms) {
            warn!("Room limit ({}) reached, cannot create room {}", self.limits.max_rooms, room_id);
            anyhow::bail!("Server is at its room limit, try again later");
        }

        let room = Arc::new(TokioRwLock::new(Room::new(
            room_id.to_string(),
            &self.limits,
            self.metrics.clone(),
        )));
        rooms.insert(room_id.to_string(), room.clone());
        self.metrics.inc_rooms_created();
        info!("Creating new room: {}", room_id);
        Ok((room, true))
    }

    /// Drops the oldest room that has no participants. Only persisted rooms sit empty
    /// in the store, so this never discards a room someone is in.
    ///
    /// Called with the map write lock held, so room locks are only tried, never awaited.
    fn evict_oldest_empty(&self, rooms: &mut HashMap<String, Arc<TokioRwLock<Room>>>) -> bool {
        let oldest = rooms
            .iter()
            .filter_map(|(id, lock)| {
                let room = lock.try_read().ok()?;
                (room.participants.is_empty() && !room.closed).then(|| (room.started_at, id.clone()))
            })
            .min();

        let Some((_, victim_id)) = oldest else {
            return false;
        };
        let Some(victim) = rooms.get(&victim_id).cloned() else {
            return false;
        };
        let Ok(mut room) = victim.try_write() else {
            return false;
        };
        if !room.participants.is_empty() {
            return false;
        }
        room.closed = true;
        rooms.remove(&victim_id);
        self.metrics.inc_rooms_evicted();
        info!("Evicted empty persisted room {} to make space", victim_id);
        true
    }

    /// Removes a room from the store, but only if the entry is still this exact room
    fn remove_room_entry(&self, room_id: &str, room_lock: &Arc<TokioRwLock<Room>>) {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        if rooms.get(room_id).is_some_and(|existing| Arc::ptr_eq(existing, room_lock)) {
            rooms.remove(room_id);
        }
    }

    /// Adds a participant to a room (creates room if needed).
    ///
    /// The joiner's snapshot frames are queued while the room lock is held, so no
    /// later room event can reach the joiner ahead of them.
    ///
    /// # Errors
    /// Returns an error if the room limit is reached and nothing can be evicted
    pub async fn join_room(
        &self,
        room_id: &str,
        participant_id: &str,
        user_name: &str,
        initial_status: ParticipantStatus,
        client: ClientHandle,
    ) -> Result<JoinSnapshot> {
        loop {
            let (room_lock, is_new_room) = self.get_or_create_room(room_id)?;
            let mut room = room_lock.write().await;
            if room.closed {
                // Lost a race with deletion; the store no longer holds this room
                drop(room);
                tokio::task::yield_now().await;
                continue;
            }

            let name = display_name(user_name, participant_id);
            let participant = Participant {
                id: participant_id.to_string(),
                name: name.clone(),
                client,
                status: initial_status,
            };
            room.participants.insert(participant_id.to_string(), participant);
            self.metrics.inc_joins();

            info!("Participant {} ({}) joined room {}", participant_id, name, room_id);

            room.broadcast_except(participant_id, &ServerMessage::UserJoined {
                id: participant_id.to_string(),
                user_name: name,
            });

            let snapshot = JoinSnapshot {
                is_new_room,
                participants: room
                    .participants
                    .values()
                    .filter(|p| p.id != participant_id)
                    .map(ParticipantInfo::from)
                    .collect(),
                history: room.messages.public_history(),
                settings: room.settings.clone(),
                started_at: room.started_at,
                recording: room.recording_state(),
            };

            room.send_to(participant_id, &ServerMessage::ExistingParticipants {
                participants: snapshot.participants.clone(),
            });
            room.send_to(participant_id, &ServerMessage::ChatHistory {
                messages: snapshot.history.clone(),
            });
            room.send_to(participant_id, &ServerMessage::RoomSettingsUpdated {
                settings: snapshot.settings.clone(),
            });
            room.send_to(participant_id, &ServerMessage::RoomStartTime {
                start_time: snapshot.started_at,
            });
            room.send_to(participant_id, &ServerMessage::RecordingStateUpdated {
                recording: snapshot.recording.clone(),
            });

            self.settle(&room_lock, &mut room);
            return Ok(snapshot);
        }
    }

    /// Removes a participant from a room. Returns false if it was not there.
    ///
    /// Stops a recording the leaver started, and deletes the room once it is empty
    /// unless it was marked to persist.
    pub async fn leave_room(&self, room_id: &str, participant_id: &str) -> bool {
        let Some(room_lock) = self.get_room(room_id) else {
            debug!("leave: room {} not found", room_id);
            return false;
        };

        let mut room = room_lock.write().await;
        if room.remove_participant(participant_id).is_none() {
            debug!("leave: {} is not in room {}", participant_id, room_id);
            return false;
        }
        self.metrics.inc_leaves();
        info!("Participant {} left room {}", participant_id, room_id);

        self.settle(&room_lock, &mut room);
        true
    }

    /// Ends every room operation, still under the room lock: evicts members that fell
    /// behind, then deletes the room if it is empty and not persisted.
    pub(crate) fn settle(&self, room_lock: &Arc<TokioRwLock<Room>>, room: &mut Room) {
        room.evict_lagging();
        if room.participants.is_empty() && !room.settings.persist_after_empty && !room.closed {
            room.closed = true;
            self.remove_room_entry(&room.id, room_lock);
            self.metrics.inc_rooms_closed();
            info!("Room {} is empty, cleaning up", room.id);
        }
    }

    /// Closes every room. Participants are not notified; their sockets are going away.
    pub async fn shutdown(&self) {
        info!("Shutting down all rooms...");

        let all_rooms: Vec<(String, Arc<TokioRwLock<Room>>)> = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.drain().collect()
        };

        for (room_id, room_lock) in &all_rooms {
            let mut room = room_lock.write().await;
            room.closed = true;
            info!("Shut down room {} ({} participants)", room_id, room.participants.len());
        }

        info!("All rooms shut down ({} total)", all_rooms.len());
    }

    /// Gets current room count
    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Gets total participant count across all rooms.
    /// Rooms busy with a write are skipped, so this is approximate under load.
    pub fn total_participant_count(&self) -> usize {
        let room_locks: Vec<Arc<TokioRwLock<Room>>> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().cloned().collect()
        };

        room_locks
            .iter()
            .filter_map(|lock| lock.try_read().ok().map(|room| room.participants.len()))
            .sum()
    }

    /// Gets participant count for a specific room (non-async, brief read lock)
    pub fn participant_count_for_room(&self, room_id: &str) -> usize {
        self.get_room(room_id)
            .and_then(|lock| lock.try_read().ok().map(|room| room.participants.len()))
            .unwrap_or(0)
    }

    pub fn has_room(&self, room_id: &str) -> bool {
        self.get_room(room_id).is_some()
    }
}

#[cfg(test)]
impl RoomManager {
    pub(crate) async fn participant_status(&self, room_id: &str, id: &str) -> Option<ParticipantStatus> {
        let room_lock = self.get_room(room_id)?;
        let room = room_lock.read().await;
        room.participants.get(id).map(|p| p.status)
    }

    pub(crate) async fn recording_state(&self, room_id: &str) -> Option<RecordingState> {
        let room_lock = self.get_room(room_id)?;
        let room = room_lock.read().await;
        Some(room.recording_state())
    }

    pub(crate) async fn message_count(&self, room_id: &str) -> Option<usize> {
        let room_lock = self.get_room(room_id)?;
        let room = room_lock.read().await;
        Some(room.messages.len())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::room::settings::SettingsPatch;
    use tokio::sync::mpsc;

    pub(crate) fn manager() -> RoomManager {
        RoomManager::new(RoomLimits::default(), ServerMetrics::new())
    }

    /// Everything queued on a receiver so far, parsed
    pub(crate) fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<serde_json::Value> {
        let mut frames = Vec::new();
        while let Ok(json) = rx.try_recv() {
            frames.push(serde_json::from_str(&json).unwrap());
        }
        frames
    }

    /// A manager with the given participants joined to one room, all receivers drained
    pub(crate) async fn joined_manager(
        room_id: &str,
        members: &[(&str, &str)],
    ) -> (RoomManager, Vec<mpsc::Receiver<Arc<String>>>) {
        let rm = manager();
        let mut receivers = Vec::new();
        for (id, name) in members {
            let (tx, rx) = mpsc::channel(64);
            rm.join_room(room_id, id, name, ParticipantStatus::default(), tx.into()).await.unwrap();
            receivers.push(rx);
        }
        for rx in receivers.iter_mut() {
            drain(rx);
        }
        (rm, receivers)
    }

    fn types(frames: &[serde_json::Value]) -> Vec<&str> {
        frames.iter().filter_map(|f| f["type"].as_str()).collect()
    }

    #[test]
    fn test_default_display_name() {
        assert_eq!(display_name("  Alice ", "abcdef"), "Alice");
        assert_eq!(display_name("", "abcdef"), "User abcd");
        assert_eq!(display_name("   ", "ab"), "User ab");
    }

    #[tokio::test]
    async fn test_join_sends_snapshot_in_order() {
        let rm = manager();
        let (tx, mut rx) = mpsc::channel(64);
        let snapshot = rm.join_room("r1", "a", "Alice", ParticipantStatus::default(), tx.into()).await.unwrap();
        assert!(snapshot.is_new_room);
        assert!(snapshot.participants.is_empty());

        let frames = drain(&mut rx);
        assert_eq!(
            types(&frames),
            vec![
                "existing-participants",
                "chat-history",
                "room-settings-updated",
                "room-start-time",
                "recording-state-updated",
            ]
        );
        assert_eq!(frames[2]["settings"]["persistAfterEmpty"], false);
        assert_eq!(frames[4]["recording"]["active"], false);
        assert!(frames[3]["startTime"].is_string());
    }

    #[tokio::test]
    async fn test_join_announces_to_others_and_excludes_self() {
        let (rm, mut peers) = joined_manager("r1", &[("a", "Alice")]).await;

        let (tx, mut rx) = mpsc::channel(64);
        let initial = ParticipantStatus { is_camera_off: true, ..Default::default() };
        let snapshot = rm.join_room("r1", "b", "Bob", initial, tx.into()).await.unwrap();
        assert!(!snapshot.is_new_room);
        assert_eq!(snapshot.participants.len(), 1);
        assert_eq!(snapshot.participants[0].id, "a");

        let to_a = drain(&mut peers[0]);
        assert_eq!(to_a.len(), 1);
        assert_eq!(to_a[0]["type"], "user-joined");
        assert_eq!(to_a[0]["id"], "b");
        assert_eq!(to_a[0]["userName"], "Bob");

        let to_b = drain(&mut rx);
        let roster = to_b[0]["participants"].as_array().unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0]["userName"], "Alice");
        assert_eq!(roster[0]["isMuted"], false);

        let status = rm.participant_status("r1", "b").await.unwrap();
        assert!(status.is_camera_off);
        assert!(!status.is_muted);
    }

    #[tokio::test]
    async fn test_empty_room_is_deleted() {
        let (rm, mut peers) = joined_manager("r1", &[("a", "Alice"), ("b", "Bob")]).await;

        assert!(rm.leave_room("r1", "a").await);
        let to_b = drain(&mut peers[1]);
        assert_eq!(types(&to_b), vec!["user-left"]);
        assert_eq!(to_b[0]["id"], "a");
        assert!(rm.has_room("r1"));

        assert!(rm.leave_room("r1", "b").await);
        assert!(!rm.has_room("r1"));
        assert_eq!(rm.room_count(), 0);
    }

    #[tokio::test]
    async fn test_persisted_room_survives_empty() {
        let (rm, _peers) = joined_manager("r1", &[("a", "Alice")]).await;
        let patch = SettingsPatch { persist_after_empty: Some(true) };
        assert!(rm.update_settings("r1", "a", patch).await);

        rm.post_message("r1", "a", chat::ChatPayload::Text { content: "kept".to_string() }, None)
            .await
            .unwrap();
        assert!(rm.leave_room("r1", "a").await);
        assert!(rm.has_room("r1"));

        let (tx, _rx) = mpsc::channel(64);
        let snapshot = rm.join_room("r1", "b", "Bob", ParticipantStatus::default(), tx.into()).await.unwrap();
        assert!(!snapshot.is_new_room);
        assert_eq!(snapshot.history.len(), 1);
        assert!(snapshot.settings.persist_after_empty);
    }

    #[tokio::test]
    async fn test_stale_leave_is_noop() {
        let (rm, mut peers) = joined_manager("r1", &[("a", "Alice")]).await;
        assert!(!rm.leave_room("r1", "ghost").await);
        assert!(!rm.leave_room("nowhere", "a").await);
        assert!(drain(&mut peers[0]).is_empty());
        assert_eq!(rm.participant_count_for_room("r1"), 1);
    }

    #[tokio::test]
    async fn test_room_cap_evicts_oldest_empty_persisted_room() {
        let limits = RoomLimits { max_rooms: 2, max_messages_per_room: 10 };
        let rm = RoomManager::new(limits, ServerMetrics::new());

        for room in ["old", "busy"] {
            let (tx, _rx) = mpsc::channel(64);
            rm.join_room(room, room, "x", ParticipantStatus::default(), tx.into()).await.unwrap();
        }
        let patch = SettingsPatch { persist_after_empty: Some(true) };
        assert!(rm.update_settings("old", "old", patch).await);
        rm.leave_room("old", "old").await;
        assert_eq!(rm.room_count(), 2);

        let (tx, _rx) = mpsc::channel(64);
        rm.join_room("new", "n", "x", ParticipantStatus::default(), tx.into()).await.unwrap();
        assert!(!rm.has_room("old"));
        assert!(rm.has_room("busy"));
        assert!(rm.has_room("new"));

        // Nothing left to evict
        let (tx, _rx) = mpsc::channel(64);
        assert!(rm.join_room("fourth", "f", "x", ParticipantStatus::default(), tx.into()).await.is_err());
    }

    #[tokio::test]
    async fn test_closed_room_handle_is_not_joined() {
        let (rm, _peers) = joined_manager("r1", &[("a", "Alice")]).await;
        let stale = rm.get_room("r1").unwrap();

        rm.leave_room("r1", "a").await;
        assert!(stale.read().await.closed);

        let (tx, _rx) = mpsc::channel(64);
        let snapshot = rm.join_room("r1", "b", "Bob", ParticipantStatus::default(), tx.into()).await.unwrap();
        assert!(snapshot.is_new_room);
        assert!(stale.read().await.participants.is_empty());
    }

    #[tokio::test]
    async fn test_member_with_full_queue_is_evicted() {
        let (rm, mut peers) = joined_manager("r1", &[("a", "Alice")]).await;

        // Room for the five snapshot frames and nothing more
        let (tx, mut slow_rx) = mpsc::channel(5);
        let slow = ClientHandle::from(tx);
        rm.join_room("r1", "s", "Slow", ParticipantStatus::default(), slow.clone()).await.unwrap();
        assert_eq!(rm.participant_count_for_room("r1"), 2);
        drain(&mut peers[0]);

        let (tx, mut bob_rx) = mpsc::channel(64);
        rm.join_room("r1", "b", "Bob", ParticipantStatus::default(), tx.into()).await.unwrap();

        assert_eq!(rm.participant_count_for_room("r1"), 2);
        assert!(rm.participant_status("r1", "s").await.is_none());
        tokio::time::timeout(std::time::Duration::from_secs(1), slow.closed())
            .await
            .expect("evicted member's connection is told to close");

        let to_a = drain(&mut peers[0]);
        assert_eq!(types(&to_a), vec!["user-joined", "user-left"]);
        assert_eq!(to_a[1]["id"], "s");
        let to_b = drain(&mut bob_rx);
        assert_eq!(to_b.last().unwrap()["type"], "user-left");
        assert_eq!(to_b.last().unwrap()["id"], "s");

        // The evicted member only ever got its snapshot
        assert_eq!(drain(&mut slow_rx).len(), 5);
    }

    #[tokio::test]
    async fn test_evicted_initiator_stops_recording() {
        let (rm, mut peers) = joined_manager("r1", &[("a", "Alice")]).await;
        let (tx, _slow_rx) = mpsc::channel(6);
        rm.join_room("r1", "s", "Slow", ParticipantStatus::default(), tx.into()).await.unwrap();
        assert!(rm.start_recording("r1", "s").await);
        drain(&mut peers[0]);

        rm.post_message("r1", "a", chat::ChatPayload::Text { content: "hi".to_string() }, None)
            .await
            .unwrap();

        assert!(rm.participant_status("r1", "s").await.is_none());
        assert!(!rm.recording_state("r1").await.unwrap().active);
        let to_a = drain(&mut peers[0]);
        assert_eq!(types(&to_a), vec!["new-message", "user-left", "recording-state-updated"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_join_racing_last_leave_lands_in_live_room() {
        for _ in 0..100 {
            let (rm, _peers) = joined_manager("r1", &[("a", "Alice")]).await;
            let rm = Arc::new(rm);
            let (tx, _bob_rx) = mpsc::channel(64);

            let leave = {
                let rm = rm.clone();
                tokio::spawn(async move { rm.leave_room("r1", "a").await })
            };
            let join = {
                let rm = rm.clone();
                tokio::spawn(async move {
                    rm.join_room("r1", "b", "Bob", ParticipantStatus::default(), tx.into()).await
                })
            };
            assert!(leave.await.unwrap());
            join.await.unwrap().unwrap();

            assert!(rm.has_room("r1"));
            assert!(rm.participant_status("r1", "b").await.is_some());
            assert_eq!(rm.participant_count_for_room("r1"), 1);
            assert_eq!(rm.room_count(), 1);
        }
    }

    #[tokio::test]
    async fn test_counts() {
        let (rm, _peers) = joined_manager("r1", &[("a", "Alice"), ("b", "Bob")]).await;
        let (tx, _rx) = mpsc::channel(64);
        rm.join_room("r2", "c", "Cleo", ParticipantStatus::default(), tx.into()).await.unwrap();

        assert_eq!(rm.room_count(), 2);
        assert_eq!(rm.total_participant_count(), 3);
        assert_eq!(rm.participant_count_for_room("r1"), 2);
        assert_eq!(rm.participant_count_for_room("missing"), 0);

        rm.shutdown().await;
        assert_eq!(rm.room_count(), 0);
    }
}
