#![forbid(unsafe_code)]

// Huddle library - WebRTC signaling and room coordination server

pub mod config;
pub mod metrics;
pub mod room;
pub mod signaling;
pub mod turn;
