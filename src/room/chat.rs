#![forbid(unsafe_code)]

// Chat - per-room message log with public and private delivery

use super::RoomManager;
use crate::signaling::protocol::ServerMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info};

pub const MAX_TEXT_LEN: usize = 4096;
pub const MAX_GIF_URL_LEN: usize = 2048;

/// What a chat message carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChatPayload {
    Text { content: String },
    Gif { url: String },
}

impl ChatPayload {
    /// Checks size limits, counted in characters after trimming surrounding whitespace.
    /// The payload is kept exactly as sent. Rejected payloads are never stored.
    pub fn validated(self) -> anyhow::Result<Self> {
        match &self {
            ChatPayload::Text { content } => {
                let len = content.trim().chars().count();
                if len == 0 || len > MAX_TEXT_LEN {
                    anyhow::bail!("Invalid chat message: must be 1-{MAX_TEXT_LEN} characters");
                }
            }
            ChatPayload::Gif { url } => {
                let len = url.chars().count();
                if len == 0 || len > MAX_GIF_URL_LEN {
                    anyhow::bail!("Invalid gif url: must be 1-{MAX_GIF_URL_LEN} characters");
                }
                if !(url.starts_with("https://") || url.starts_with("http://")) {
                    anyhow::bail!("Invalid gif url: must be http(s)");
                }
            }
        }
        Ok(self)
    }
}

/// A posted message. Names are captured when it is sent and never updated.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: u64,
    pub sender_id: String,
    pub sender_name: String,
    pub message: ChatPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn is_private(&self) -> bool {
        self.to_id.is_some()
    }
}

/// Append-only log, capped: the oldest entry goes when the cap is hit
pub(crate) struct MessageLog {
    entries: VecDeque<ChatMessage>,
    next_id: u64,
    capacity: usize,
}

impl MessageLog {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            next_id: 1,
            capacity,
        }
    }

    pub(crate) fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub(crate) fn push(&mut self, message: ChatMessage) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(message);
    }

    /// What a new joiner is shown: public messages in posting order
    pub(crate) fn public_history(&self) -> Vec<ChatMessage> {
        self.entries.iter().filter(|m| !m.is_private()).cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

impl RoomManager {
    /// Stores and delivers a chat message.
    ///
    /// Returns `Ok(None)` when the room, the sender or the private recipient is not
    /// present (nothing is stored), and `Err` for an invalid payload.
    pub async fn post_message(
        &self,
        room_id: &str,
        sender_id: &str,
        payload: ChatPayload,
        to_id: Option<&str>,
    ) -> anyhow::Result<Option<ChatMessage>> {
        let payload = payload.validated()?;

        let Some(room_lock) = self.get_room(room_id) else {
            debug!("chat: room {} not found", room_id);
            return Ok(None);
        };
        let mut room = room_lock.write().await;

        let Some(sender_name) = room.participants.get(sender_id).map(|p| p.name.clone()) else {
            debug!("chat: {} is not in room {}", sender_id, room_id);
            return Ok(None);
        };

        let to_name = match to_id {
            Some(to) => match room.participants.get(to) {
                Some(recipient) => Some(recipient.name.clone()),
                None => {
                    debug!("chat: private recipient {} is not in room {}", to, room_id);
                    return Ok(None);
                }
            },
            None => None,
        };

        let message = ChatMessage {
            id: room.messages.next_id(),
            sender_id: sender_id.to_string(),
            sender_name,
            message: payload,
            to_id: to_id.map(String::from),
            to_name,
            timestamp: Utc::now(),
        };
        room.messages.push(message.clone());

        let event = ServerMessage::NewMessage { message: message.clone() };
        match to_id {
            Some(to) if to != sender_id => room.send_to_each(&[sender_id, to], &event),
            Some(_) => room.send_to(sender_id, &event),
            None => room.broadcast_all(&event),
        }
        self.settle(&room_lock, &mut room);

        self.metrics.inc_chat_messages();
        info!(
            "chat: {} posted message {} in room {}{}",
            sender_id,
            message.id,
            room_id,
            if message.is_private() { " (private)" } else { "" }
        );
        Ok(Some(message))
    }
}
