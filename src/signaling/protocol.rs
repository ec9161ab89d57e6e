#![forbid(unsafe_code)]

// Signaling protocol - JSON frames exchanged over the WebSocket.
//
// Every frame is an object whose "type" names the event (kebab-case); the remaining
// fields are camelCase.

use crate::metrics::ServerMetrics;
use crate::room::chat::{ChatMessage, ChatPayload};
use crate::room::recording::RecordingState;
use crate::room::settings::{RoomSettings, SettingsPatch};
use crate::room::ParticipantInfo;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::borrow::Cow;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

/// Outbound half of a connection: pre-serialized JSON frames
pub type FrameSender = mpsc::Sender<Arc<String>>;

/// What a room holds for one member: its frame queue and a way to end its session
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub frames: FrameSender,
    shutdown: Arc<Notify>,
}

impl ClientHandle {
    pub fn new(frames: FrameSender) -> Self {
        Self {
            frames,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Asks the connection task to close the socket. Remembered if nobody is waiting yet.
    pub fn close(&self) {
        self.shutdown.notify_one();
    }

    /// Resolves once `close` has been called
    pub async fn closed(&self) {
        self.shutdown.notified().await;
    }
}

impl From<FrameSender> for ClientHandle {
    fn from(frames: FrameSender) -> Self {
        Self::new(frames)
    }
}

/// Errors decoding an inbound frame
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("{event} frame is missing `{field}`")]
    MissingPayload {
        event: &'static str,
        field: &'static str,
    },
}

/// The three negotiation messages the relay forwards untouched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn from_event(event: &str) -> Option<Self> {
        match event {
            "offer" => Some(Self::Offer),
            "answer" => Some(Self::Answer),
            "ice-candidate" => Some(Self::IceCandidate),
            _ => None,
        }
    }

    pub fn event_name(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
        }
    }

    /// Name of the field carrying the opaque payload
    pub fn payload_field(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "candidate",
        }
    }
}

/// An offer/answer/candidate addressed to another connection.
/// The payload is kept as raw JSON text and never parsed.
#[derive(Debug, Clone)]
pub struct SignalMessage {
    pub kind: SignalKind,
    pub to: String,
    pub payload: Box<RawValue>,
}

/// Room-scoped client requests
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Join (creating if needed) a room. The optional flags declare media that the
    /// client failed to acquire.
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        #[serde(default)]
        user_name: String,
        #[serde(default)]
        is_muted: bool,
        #[serde(default)]
        is_camera_off: bool,
    },
    #[serde(rename_all = "camelCase")]
    LeaveRoom { room_id: String },
    #[serde(rename_all = "camelCase")]
    ToggleMute { room_id: String, is_muted: bool },
    #[serde(rename_all = "camelCase")]
    ToggleCamera { room_id: String, is_camera_off: bool },
    #[serde(rename_all = "camelCase")]
    ToggleScreenShare { room_id: String, is_screen_sharing: bool },
    #[serde(rename_all = "camelCase")]
    ToggleHandRaise { room_id: String, is_hand_raised: bool },
    /// Force another participant's microphone off
    #[serde(rename_all = "camelCase")]
    RemoteMute { room_id: String, target_id: String },
    /// Force another participant's camera off
    #[serde(rename_all = "camelCase")]
    RemoteCameraOff { room_id: String, target_id: String },
    /// Public message, or private when `to_id` is set
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        room_id: String,
        message: ChatPayload,
        #[serde(default)]
        to_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    UpdateRoomSettings { room_id: String, settings: SettingsPatch },
    #[serde(rename_all = "camelCase")]
    StartRecording { room_id: String },
    #[serde(rename_all = "camelCase")]
    StopRecording { room_id: String },
}

/// Client-to-Server messages
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Control(ControlMessage),
    Signal(SignalMessage),
}

#[derive(Deserialize)]
struct Envelope<'a> {
    #[serde(rename = "type", borrow)]
    kind: Cow<'a, str>,
}

#[derive(Deserialize)]
struct SignalFrame {
    to: String,
    #[serde(default)]
    offer: Option<Box<RawValue>>,
    #[serde(default)]
    answer: Option<Box<RawValue>>,
    #[serde(default)]
    candidate: Option<Box<RawValue>>,
}

/// Decodes one inbound text frame.
///
/// Signal frames are routed around the tagged enum so their payloads stay raw.
pub fn decode_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    let envelope: Envelope<'_> = serde_json::from_str(text)?;

    let Some(kind) = SignalKind::from_event(&envelope.kind) else {
        return Ok(ClientMessage::Control(serde_json::from_str(text)?));
    };

    let frame: SignalFrame = serde_json::from_str(text)?;
    let payload = match kind {
        SignalKind::Offer => frame.offer,
        SignalKind::Answer => frame.answer,
        SignalKind::IceCandidate => frame.candidate,
    }
    .ok_or(ProtocolError::MissingPayload {
        event: kind.event_name(),
        field: kind.payload_field(),
    })?;

    Ok(ClientMessage::Signal(SignalMessage {
        kind,
        to: frame.to,
        payload,
    }))
}

/// Server-to-Client messages
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// First frame on every connection
    Connected { id: String },
    /// A rejected request
    Error { message: String },
    #[serde(rename_all = "camelCase")]
    UserJoined { id: String, user_name: String },
    UserLeft { id: String },
    /// Roster for a new joiner, excluding itself
    ExistingParticipants { participants: Vec<ParticipantInfo> },
    /// Public messages only
    ChatHistory { messages: Vec<ChatMessage> },
    RoomSettingsUpdated { settings: RoomSettings },
    #[serde(rename_all = "camelCase")]
    RoomStartTime { start_time: DateTime<Utc> },
    RecordingStateUpdated { recording: RecordingState },
    Offer { from: String, offer: Box<RawValue> },
    Answer { from: String, answer: Box<RawValue> },
    IceCandidate { from: String, candidate: Box<RawValue> },
    #[serde(rename_all = "camelCase")]
    UserToggledMute { id: String, is_muted: bool },
    #[serde(rename_all = "camelCase")]
    UserToggledCamera { id: String, is_camera_off: bool },
    #[serde(rename_all = "camelCase")]
    UserToggledScreenShare { id: String, is_screen_sharing: bool },
    #[serde(rename_all = "camelCase")]
    UserToggledHandRaise { id: String, is_hand_raised: bool },
    ForceMute { by: String },
    ForceCameraOff { by: String },
    NewMessage { message: ChatMessage },
}

impl ServerMessage {
    pub fn relayed(kind: SignalKind, from: String, payload: Box<RawValue>) -> Self {
        match kind {
            SignalKind::Offer => Self::Offer { from, offer: payload },
            SignalKind::Answer => Self::Answer { from, answer: payload },
            SignalKind::IceCandidate => Self::IceCandidate { from, candidate: payload },
        }
    }

    pub fn encode(&self) -> Result<Arc<String>, serde_json::Error> {
        Ok(Arc::new(serde_json::to_string(self)?))
    }
}

/// Serialize a ServerMessage and queue it on one connection.
pub fn send_json(sender: &FrameSender, msg: &ServerMessage) -> anyhow::Result<()> {
    let json = msg.encode()?;
    sender.try_send(json).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

/// Outcome of queueing one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Recipient's queue is full; the frame was dropped
    Full,
    /// Recipient is gone
    Closed,
}

/// Queue an already-serialized frame, never blocking
pub fn try_deliver(
    sender: &FrameSender,
    json: Arc<String>,
    recipient: &str,
    metrics: &ServerMetrics,
) -> Delivery {
    match sender.try_send(json) {
        Ok(()) => Delivery::Queued,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("Channel full for connection {}, dropping message", recipient);
            metrics.inc_messages_dropped();
            Delivery::Full
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Channel closed for connection {} (disconnected)", recipient);
            Delivery::Closed
        }
    }
}
