#![forbid(unsafe_code)]

// Huddle library - multiparty meeting signaling in front of an SFU

pub mod auth;
pub mod config;
pub mod error;
pub mod media;
pub mod room;
pub mod signaling;
pub mod turn;
