#![forbid(unsafe_code)]

// Peer and lobby peer records plus the media objects a peer owns

use super::permissions::RoleSet;
use super::roles::Role;
use crate::media::{Layers, MediaKind, TransportDirection};
use crate::signaling::protocol::{LobbyPeerInfo, PeerInfo, ProducerInfo};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

pub type PeerId = String;

/// Frame queued for a client's socket.
#[derive(Debug, Clone)]
pub enum Outbound {
    Text(Arc<String>),
    /// Close the socket after the frames queued before it.
    Close,
}

/// Handle to a client's outbound queue.
pub type PeerChannel = mpsc::Sender<Outbound>;

/// What a producer carries; selects the permission needed to create it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerSource {
    Mic,
    Webcam,
    Screen,
    ExtraVideo,
    Data,
}

impl ProducerSource {
    pub fn default_for(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => ProducerSource::Mic,
            MediaKind::Video => ProducerSource::Webcam,
            MediaKind::Data => ProducerSource::Data,
        }
    }

    pub fn matches(self, kind: MediaKind) -> bool {
        match self {
            ProducerSource::Mic => kind == MediaKind::Audio,
            ProducerSource::Webcam | ProducerSource::Screen | ProducerSource::ExtraVideo => {
                kind == MediaKind::Video
            }
            ProducerSource::Data => kind == MediaKind::Data,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Transport {
    pub id: String,
    pub direction: TransportDirection,
    pub connected: bool,
}

#[derive(Debug, Clone)]
pub struct Producer {
    pub id: String,
    pub kind: MediaKind,
    pub source: ProducerSource,
    pub transport_id: String,
    pub paused: bool,
}

impl Producer {
    pub fn info(&self) -> ProducerInfo {
        ProducerInfo {
            id: self.id.clone(),
            kind: self.kind,
            source: self.source,
            paused: self.paused,
        }
    }
}

/// Subscription to a producer owned by another peer of the same room.
#[derive(Debug, Clone)]
pub struct Consumer {
    pub id: String,
    pub producer_id: String,
    pub producer_peer_id: PeerId,
    pub transport_id: String,
    pub kind: MediaKind,
    /// Paused by the consuming client.
    pub paused: bool,
    /// Paused because the producer is paused.
    pub producer_paused: bool,
    pub current_layers: Option<Layers>,
    pub preferred_layers: Option<Layers>,
}

#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    pub display_name: String,
    pub picture: Option<String>,
    pub roles: RoleSet,
    pub rtp_capabilities: Option<Value>,
    pub transports: IndexMap<String, Transport>,
    pub producers: IndexMap<String, Producer>,
    pub consumers: IndexMap<String, Consumer>,
    pub raised_hand: bool,
    pub channel: PeerChannel,
}

impl Peer {
    pub fn new(
        id: PeerId,
        display_name: String,
        picture: Option<String>,
        roles: RoleSet,
        rtp_capabilities: Option<Value>,
        channel: PeerChannel,
    ) -> Self {
        let mut roles = roles;
        roles.insert(Role::DEFAULT);
        Self {
            id,
            display_name,
            picture,
            roles,
            rtp_capabilities,
            transports: IndexMap::new(),
            producers: IndexMap::new(),
            consumers: IndexMap::new(),
            raised_hand: false,
            channel,
        }
    }

    /// Highest role level held, used to bound role grants.
    pub fn max_level(&self) -> u8 {
        self.roles.iter().map(|role| role.level()).max().unwrap_or(0)
    }

    /// The transport new consumers attach to, if any.
    pub fn recv_transport(&self) -> Option<&Transport> {
        self.transports
            .values()
            .find(|t| t.direction == TransportDirection::Recv)
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            picture: self.picture.clone(),
            roles: self.roles.iter().copied().collect(),
            raised_hand: self.raised_hand,
            producers: self.producers.values().map(Producer::info).collect(),
        }
    }
}

/// A peer waiting for admission. Has no media graph.
#[derive(Debug)]
pub struct LobbyPeer {
    pub id: PeerId,
    pub display_name: String,
    pub picture: Option<String>,
    pub roles: RoleSet,
    pub rtp_capabilities: Option<Value>,
    pub channel: PeerChannel,
}

/// A peer parked in the lobby has no media yet; only its identity is kept.
impl From<Peer> for LobbyPeer {
    fn from(peer: Peer) -> Self {
        Self {
            id: peer.id,
            display_name: peer.display_name,
            picture: peer.picture,
            roles: peer.roles,
            rtp_capabilities: peer.rtp_capabilities,
            channel: peer.channel,
        }
    }
}

impl LobbyPeer {
    pub fn info(&self) -> LobbyPeerInfo {
        LobbyPeerInfo {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            picture: self.picture.clone(),
        }
    }

    /// Turns the lobby record into a joined peer.
    pub fn into_peer(self) -> Peer {
        Peer::new(
            self.id,
            self.display_name,
            self.picture,
            self.roles,
            self.rtp_capabilities,
            self.channel,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_must_match_kind() {
        assert!(ProducerSource::Mic.matches(MediaKind::Audio));
        assert!(!ProducerSource::Mic.matches(MediaKind::Video));
        assert!(ProducerSource::Screen.matches(MediaKind::Video));
        assert!(!ProducerSource::Data.matches(MediaKind::Audio));
        assert_eq!(ProducerSource::default_for(MediaKind::Video), ProducerSource::Webcam);
    }

    #[test]
    fn test_new_peer_always_holds_default_role() {
        let (tx, _rx) = mpsc::channel(1);
        let peer = Peer::new("p".into(), "P".into(), None, RoleSet::new(), None, tx);
        assert!(peer.roles.contains(&Role::Normal));
        assert_eq!(peer.max_level(), Role::Normal.level());
    }
}
