#![forbid(unsafe_code)]

// Room module - per-room state, admission control and the room registry
pub mod actor;
pub mod handlers;
pub mod peer;
pub mod permissions;
pub mod registry;
pub mod roles;
pub mod spotlight;
pub mod state;

pub use actor::{Admission, RoomContext, RoomHandle};
pub use peer::{Outbound, PeerChannel, PeerId};
pub use registry::RoomRegistry;
pub use state::{RoomId, RoomSummary};

use crate::error::{SignalingError, SignalingResult};

/// Maximum room id length (bytes).
pub const MAX_ROOM_ID_LEN: usize = 128;
/// Maximum peer id length (bytes).
pub const MAX_PEER_ID_LEN: usize = 128;
/// Maximum display name length (characters).
pub const MAX_DISPLAY_NAME_LEN: usize = 64;
/// Maximum chat message length (characters).
pub const MAX_CHAT_LEN: usize = 4096;
/// Maximum picture URL length (bytes).
pub const MAX_PICTURE_LEN: usize = 2048;
/// Maximum magnet URI length (bytes).
pub const MAX_MAGNET_URI_LEN: usize = 2048;

fn validate_id(what: &str, value: &str, max: usize) -> SignalingResult<()> {
    if value.is_empty() || value.len() > max {
        return Err(SignalingError::Validation(format!(
            "{what} must be 1-{max} bytes"
        )));
    }
    if value.chars().any(char::is_control) {
        return Err(SignalingError::Validation(format!(
            "{what} contains control characters"
        )));
    }
    Ok(())
}

pub fn validate_room_id(room_id: &str) -> SignalingResult<()> {
    validate_id("roomId", room_id, MAX_ROOM_ID_LEN)
}

pub fn validate_peer_id(peer_id: &str) -> SignalingResult<()> {
    validate_id("peerId", peer_id, MAX_PEER_ID_LEN)
}

pub fn validate_display_name(name: &str) -> SignalingResult<()> {
    if name.trim().is_empty() || name.chars().count() > MAX_DISPLAY_NAME_LEN {
        return Err(SignalingError::Validation(format!(
            "displayName must be 1-{MAX_DISPLAY_NAME_LEN} characters"
        )));
    }
    Ok(())
}

pub fn validate_picture(picture: &str) -> SignalingResult<()> {
    if picture.len() > MAX_PICTURE_LEN {
        return Err(SignalingError::Validation(format!(
            "picture must be at most {MAX_PICTURE_LEN} bytes"
        )));
    }
    Ok(())
}

pub fn validate_chat(text: &str) -> SignalingResult<()> {
    if text.trim().is_empty() || text.chars().count() > MAX_CHAT_LEN {
        return Err(SignalingError::Validation(format!(
            "chat messages must be 1-{MAX_CHAT_LEN} characters"
        )));
    }
    Ok(())
}

pub fn validate_magnet_uri(uri: &str) -> SignalingResult<()> {
    if !uri.starts_with("magnet:") || uri.len() > MAX_MAGNET_URI_LEN {
        return Err(SignalingError::Validation("magnetUri must be a magnet link".into()));
    }
    Ok(())
}
