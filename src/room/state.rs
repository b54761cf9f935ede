#![forbid(unsafe_code)]

// Room state - the peer/lobby graph of one room and its cascades
//
// Everything here is synchronous. Mutations record the notifications
// they imply in an Outbox; the room actor dispatches it once the turn
// completes.

use super::peer::{LobbyPeer, Peer, PeerChannel, PeerId, Producer};
use super::permissions::RoleSet;
use super::roles::{Access, Permission};
use super::spotlight::SpotlightPolicy;
use crate::config::RoomPolicy;
use crate::error::{SignalingError, SignalingResult};
use crate::media::MediaObject;
use crate::signaling::protocol::{ChatEntry, FileEntry, Notification, RoomSnapshot};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::info;

pub type RoomId = String;

/// Addressee of a notification.
#[derive(Debug, Clone)]
pub enum Recipient {
    /// Resolved at dispatch against joined peers, then the lobby.
    Peer(PeerId),
    /// A client that is no longer part of the room.
    Channel(PeerChannel),
}

#[derive(Debug)]
pub enum Delivery {
    Notify {
        to: Vec<Recipient>,
        notification: Notification,
    },
    /// Close the client's socket after everything queued before it.
    Disconnect(PeerChannel),
}

/// Notifications produced by one mutation turn, in emission order.
#[derive(Debug, Default)]
pub struct Outbox {
    deliveries: Vec<Delivery>,
}

impl Outbox {
    pub fn notify(&mut self, peer_id: &str, notification: Notification) {
        self.deliveries.push(Delivery::Notify {
            to: vec![Recipient::Peer(peer_id.to_string())],
            notification,
        });
    }

    pub fn notify_all(&mut self, peers: Vec<PeerId>, notification: Notification) {
        if peers.is_empty() {
            return;
        }
        self.deliveries.push(Delivery::Notify {
            to: peers.into_iter().map(Recipient::Peer).collect(),
            notification,
        });
    }

    pub fn notify_channel(&mut self, channel: PeerChannel, notification: Notification) {
        self.deliveries.push(Delivery::Notify {
            to: vec![Recipient::Channel(channel)],
            notification,
        });
    }

    pub fn disconnect(&mut self, channel: PeerChannel) {
        self.deliveries.push(Delivery::Disconnect(channel));
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }

    pub fn into_deliveries(self) -> Vec<Delivery> {
        self.deliveries
    }

    /// Notifications addressed to `peer_id` by id.
    #[cfg(test)]
    pub fn addressed_to(&self, peer_id: &str) -> Vec<&Notification> {
        self.deliveries
            .iter()
            .filter_map(|delivery| match delivery {
                Delivery::Notify { to, notification }
                    if to.iter().any(|r| matches!(r, Recipient::Peer(id) if id == peer_id)) =>
                {
                    Some(notification)
                }
                _ => None,
            })
            .collect()
    }
}

/// Who hears about a closed producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerCloseNotice {
    /// Part of a departure; `peerClosed` covers it.
    Silent,
    /// The owner closed it and already knows.
    Others,
    /// Closed by a moderator; the owner must learn of it too.
    Everyone,
}

/// Published after every turn for observers outside the room.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub id: RoomId,
    pub locked: bool,
    pub peers: Vec<PeerSummary>,
    pub lobby_peers: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub id: PeerId,
    pub display_name: String,
}

pub struct Room {
    pub id: RoomId,
    pub locked: bool,
    pub peers: IndexMap<PeerId, Peer>,
    pub lobby: IndexMap<PeerId, LobbyPeer>,
    pub active_speaker_id: Option<PeerId>,
    pub spotlights: Vec<PeerId>,
    pub router_rtp_capabilities: Value,
    /// Most recent speaker first.
    speakers: Vec<PeerId>,
    producer_owners: HashMap<String, PeerId>,
    chat_history: VecDeque<ChatEntry>,
    file_history: VecDeque<FileEntry>,
    policy: Arc<RoomPolicy>,
    spotlight_policy: Arc<dyn SpotlightPolicy>,
}

impl Room {
    pub fn new(
        id: RoomId,
        policy: Arc<RoomPolicy>,
        spotlight_policy: Arc<dyn SpotlightPolicy>,
    ) -> Self {
        Self {
            id,
            locked: policy.starts_locked,
            peers: IndexMap::new(),
            lobby: IndexMap::new(),
            active_speaker_id: None,
            spotlights: Vec::new(),
            router_rtp_capabilities: Value::Null,
            speakers: Vec::new(),
            producer_owners: HashMap::new(),
            chat_history: VecDeque::new(),
            file_history: VecDeque::new(),
            policy,
            spotlight_policy,
        }
    }

    pub fn policy(&self) -> &RoomPolicy {
        &self.policy
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty() && self.lobby.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.peers.len() >= self.policy.max_peers
    }

    pub fn has_permission(&self, roles: &RoleSet, action: Permission) -> bool {
        self.policy
            .roles
            .has_permission(roles, self.peers.values().map(|peer| &peer.roles), action)
    }

    pub fn has_access(&self, roles: &RoleSet, access: Access) -> bool {
        self.policy.roles.has_access(roles, access)
    }

    /// Fails unless `peer_id` is joined and may perform `action`.
    pub fn require(&self, peer_id: &str, action: Permission) -> SignalingResult<()> {
        let peer = self.peers.get(peer_id).ok_or_else(SignalingError::not_joined)?;
        if self.has_permission(&peer.roles, action) {
            Ok(())
        } else {
            Err(SignalingError::PermissionDenied(format!(
                "{} is required",
                action.as_str()
            )))
        }
    }

    pub fn peer(&self, peer_id: &str) -> SignalingResult<&Peer> {
        self.peers.get(peer_id).ok_or_else(SignalingError::not_joined)
    }

    pub fn peer_mut(&mut self, peer_id: &str) -> SignalingResult<&mut Peer> {
        self.peers.get_mut(peer_id).ok_or_else(SignalingError::not_joined)
    }

    /// Joined peers in join order.
    pub fn everyone(&self) -> Vec<PeerId> {
        self.peers.keys().cloned().collect()
    }

    /// Joined peers other than `except`, in join order.
    pub fn others(&self, except: &str) -> Vec<PeerId> {
        self.peers.keys().filter(|id| *id != except).cloned().collect()
    }

    /// Joined peers allowed to perform `action`.
    pub fn holders_of(&self, action: Permission) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|peer| self.has_permission(&peer.roles, action))
            .map(|peer| peer.id.clone())
            .collect()
    }

    /// Outbound channel of a joined or waiting peer.
    pub fn channel_of(&self, peer_id: &str) -> Option<&PeerChannel> {
        self.peers
            .get(peer_id)
            .map(|peer| &peer.channel)
            .or_else(|| self.lobby.get(peer_id).map(|lobby_peer| &lobby_peer.channel))
    }

    pub fn producer_owner(&self, producer_id: &str) -> Option<&PeerId> {
        self.producer_owners.get(producer_id)
    }

    pub fn snapshot(&self, peer_id: &str, roles: &RoleSet) -> RoomSnapshot {
        let lobby_peers = if self.has_permission(roles, Permission::PromotePeer) {
            self.lobby.values().map(LobbyPeer::info).collect()
        } else {
            Vec::new()
        };

        RoomSnapshot {
            room_id: self.id.clone(),
            peer_id: peer_id.to_string(),
            roles: roles.iter().copied().collect(),
            peers: self
                .peers
                .values()
                .filter(|peer| peer.id != peer_id)
                .map(Peer::info)
                .collect(),
            locked: self.locked,
            spotlights: self.spotlights.clone(),
            active_speaker_id: self.active_speaker_id.clone(),
            lobby_peers,
            chat_history: self.chat_history.iter().cloned().collect(),
            file_history: self.file_history.iter().cloned().collect(),
            router_rtp_capabilities: self.router_rtp_capabilities.clone(),
        }
    }

    /// Adds a peer to the room and returns its join snapshot.
    pub fn admit(&mut self, peer: Peer, outbox: &mut Outbox) -> RoomSnapshot {
        let peer_id = peer.id.clone();
        let roles = peer.roles.clone();

        outbox.notify_all(self.everyone(), Notification::NewPeer(peer.info()));
        self.peers.insert(peer_id.clone(), peer);

        if self.recompute_spotlights() {
            outbox.notify_all(
                self.others(&peer_id),
                Notification::SpotlightsChanged {
                    peer_ids: self.spotlights.clone(),
                },
            );
        }

        info!("Peer {} joined room {}", peer_id, self.id);
        self.snapshot(&peer_id, &roles)
    }

    pub fn enter_lobby(&mut self, lobby_peer: LobbyPeer, outbox: &mut Outbox) {
        outbox.notify_all(
            self.holders_of(Permission::PromotePeer),
            Notification::LobbyPeerAdded(lobby_peer.info()),
        );
        info!("Peer {} is waiting in the lobby of room {}", lobby_peer.id, self.id);
        self.lobby.insert(lobby_peer.id.clone(), lobby_peer);
    }

    /// Moves a lobby peer into the room.
    pub fn promote(
        &mut self,
        peer_id: &str,
        promoted_by: Option<&str>,
        outbox: &mut Outbox,
    ) -> SignalingResult<()> {
        if !self.lobby.contains_key(peer_id) {
            return Err(SignalingError::NotFound(format!(
                "peer {peer_id} is not in the lobby"
            )));
        }
        if self.is_full() {
            return Err(SignalingError::Conflict("room is full".into()));
        }
        let Some(lobby_peer) = self.lobby.shift_remove(peer_id) else {
            return Err(SignalingError::NotFound(format!(
                "peer {peer_id} is not in the lobby"
            )));
        };

        outbox.notify_all(
            self.holders_of(Permission::PromotePeer),
            Notification::LobbyPeerPromoted {
                peer_id: peer_id.to_string(),
                promoted_by: promoted_by.map(str::to_string),
            },
        );
        let snapshot = self.admit(lobby_peer.into_peer(), outbox);
        outbox.notify(peer_id, Notification::RoomReady(snapshot));
        Ok(())
    }

    pub fn remove_lobby_peer(&mut self, peer_id: &str, outbox: &mut Outbox) -> Option<LobbyPeer> {
        let lobby_peer = self.lobby.shift_remove(peer_id)?;
        outbox.notify_all(
            self.holders_of(Permission::PromotePeer),
            Notification::LobbyPeerClosed {
                peer_id: peer_id.to_string(),
            },
        );
        Some(lobby_peer)
    }

    pub fn add_producer(&mut self, peer_id: &str, producer: Producer, outbox: &mut Outbox) {
        let notification = Notification::NewProducer {
            peer_id: peer_id.to_string(),
            producer_id: producer.id.clone(),
            kind: producer.kind,
            source: producer.source,
            paused: producer.paused,
        };
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };
        self.producer_owners.insert(producer.id.clone(), peer_id.to_string());
        peer.producers.insert(producer.id.clone(), producer);
        outbox.notify_all(self.others(peer_id), notification);
    }

    /// Detaches a producer and every consumer of it.
    ///
    /// Returns the engine objects to close, dependents first, or `None`
    /// when the producer is unknown.
    pub fn close_producer(
        &mut self,
        producer_id: &str,
        notice: ProducerCloseNotice,
        outbox: &mut Outbox,
    ) -> Option<Vec<MediaObject>> {
        let owner_id = self.producer_owners.remove(producer_id)?;
        let mut objects = Vec::new();

        for peer in self.peers.values_mut() {
            let dependents: Vec<String> = peer
                .consumers
                .values()
                .filter(|consumer| consumer.producer_id == producer_id)
                .map(|consumer| consumer.id.clone())
                .collect();
            for consumer_id in dependents {
                peer.consumers.shift_remove(&consumer_id);
                outbox.notify(
                    &peer.id,
                    Notification::ConsumerClosed {
                        consumer_id: consumer_id.clone(),
                        producer_id: producer_id.to_string(),
                    },
                );
                objects.push(MediaObject::Consumer(consumer_id));
            }
        }

        if let Some(owner) = self.peers.get_mut(&owner_id) {
            owner.producers.shift_remove(producer_id);
        }
        objects.push(MediaObject::Producer(producer_id.to_string()));

        let audience = match notice {
            ProducerCloseNotice::Silent => Vec::new(),
            ProducerCloseNotice::Others => self.others(&owner_id),
            ProducerCloseNotice::Everyone => self.everyone(),
        };
        outbox.notify_all(
            audience,
            Notification::ProducerClosed {
                peer_id: owner_id,
                producer_id: producer_id.to_string(),
            },
        );

        Some(objects)
    }

    /// Removes a joined peer with everything it owns and everything that
    /// depends on it. Returns the engine objects to close, or `None` when
    /// the peer is not joined.
    pub fn remove_peer(&mut self, peer_id: &str, outbox: &mut Outbox) -> Option<Vec<MediaObject>> {
        let (consumers, producers, transports) = {
            let peer = self.peers.get_mut(peer_id)?;
            let consumers: Vec<String> = peer.consumers.drain(..).map(|(id, _)| id).collect();
            let producers: Vec<String> = peer.producers.keys().cloned().collect();
            let transports: Vec<String> = peer.transports.drain(..).map(|(id, _)| id).collect();
            (consumers, producers, transports)
        };

        let mut objects: Vec<MediaObject> = consumers.into_iter().map(MediaObject::Consumer).collect();
        for producer_id in producers {
            if let Some(closed) = self.close_producer(&producer_id, ProducerCloseNotice::Silent, outbox) {
                objects.extend(closed);
            }
        }
        objects.extend(transports.into_iter().map(MediaObject::Transport));

        self.peers.shift_remove(peer_id);
        self.speakers.retain(|id| id != peer_id);

        if self.active_speaker_id.as_deref() == Some(peer_id) {
            self.active_speaker_id = None;
            outbox.notify_all(self.everyone(), Notification::ActiveSpeaker { peer_id: None });
        }
        if self.recompute_spotlights() {
            outbox.notify_all(
                self.everyone(),
                Notification::SpotlightsChanged {
                    peer_ids: self.spotlights.clone(),
                },
            );
        }
        outbox.notify_all(
            self.everyone(),
            Notification::PeerClosed {
                peer_id: peer_id.to_string(),
            },
        );

        info!("Peer {} left room {}", peer_id, self.id);
        Some(objects)
    }

    /// Returns whether the spotlight set changed.
    pub fn recompute_spotlights(&mut self) -> bool {
        let joined: Vec<&str> = self.peers.keys().map(String::as_str).collect();
        let next = self
            .spotlight_policy
            .select(&joined, &self.speakers, self.policy.spotlight_limit());
        if next == self.spotlights {
            return false;
        }
        self.spotlights = next;
        true
    }

    /// Marks `peer_id` as the current speaker.
    pub fn record_speech(&mut self, peer_id: &str, outbox: &mut Outbox) {
        if !self.peers.contains_key(peer_id) {
            return;
        }
        self.speakers.retain(|id| id != peer_id);
        self.speakers.insert(0, peer_id.to_string());

        if self.active_speaker_id.as_deref() != Some(peer_id) {
            self.active_speaker_id = Some(peer_id.to_string());
            outbox.notify_all(
                self.everyone(),
                Notification::ActiveSpeaker {
                    peer_id: Some(peer_id.to_string()),
                },
            );
        }
        if self.recompute_spotlights() {
            outbox.notify_all(
                self.everyone(),
                Notification::SpotlightsChanged {
                    peer_ids: self.spotlights.clone(),
                },
            );
        }
    }

    pub fn clear_active_speaker(&mut self, outbox: &mut Outbox) {
        if self.active_speaker_id.take().is_some() {
            outbox.notify_all(self.everyone(), Notification::ActiveSpeaker { peer_id: None });
        }
    }

    pub fn push_chat(&mut self, entry: ChatEntry) {
        self.chat_history.push_back(entry);
        while self.chat_history.len() > self.policy.chat_history_limit {
            self.chat_history.pop_front();
        }
    }

    pub fn clear_chat(&mut self) {
        self.chat_history.clear();
    }

    pub fn push_file(&mut self, entry: FileEntry) {
        self.file_history.push_back(entry);
        while self.file_history.len() > self.policy.chat_history_limit {
            self.file_history.pop_front();
        }
    }

    pub fn clear_files(&mut self) {
        self.file_history.clear();
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            id: self.id.clone(),
            locked: self.locked,
            peers: self
                .peers
                .values()
                .map(|peer| PeerSummary {
                    id: peer.id.clone(),
                    display_name: peer.display_name.clone(),
                })
                .collect(),
            lobby_peers: self.lobby.len(),
        }
    }

    /// Checks the graph's structural invariants.
    #[cfg(test)]
    pub fn verify(&self) -> Result<(), String> {
        let mut producers = 0;
        for peer in self.peers.values() {
            if self.lobby.contains_key(&peer.id) {
                return Err(format!("{} is both joined and waiting", peer.id));
            }
            for consumer in peer.consumers.values() {
                let Some(owner) = self.peers.get(&consumer.producer_peer_id) else {
                    return Err(format!("consumer {} outlived its producer's peer", consumer.id));
                };
                if owner.id == peer.id {
                    return Err(format!("consumer {} consumes its own peer", consumer.id));
                }
                if !owner.producers.contains_key(&consumer.producer_id) {
                    return Err(format!("consumer {} outlived its producer", consumer.id));
                }
                if !peer.transports.contains_key(&consumer.transport_id) {
                    return Err(format!("consumer {} has no transport", consumer.id));
                }
            }
            for producer in peer.producers.values() {
                producers += 1;
                if self.producer_owners.get(&producer.id) != Some(&peer.id) {
                    return Err(format!("producer {} is not indexed", producer.id));
                }
                if !peer.transports.contains_key(&producer.transport_id) {
                    return Err(format!("producer {} has no transport", producer.id));
                }
            }
        }
        if producers != self.producer_owners.len() {
            return Err("producer index holds closed producers".into());
        }
        if let Some(speaker) = &self.active_speaker_id {
            if !self.peers.contains_key(speaker) {
                return Err(format!("active speaker {speaker} is not joined"));
            }
        }
        if self.spotlights.len() > self.policy.spotlight_limit() {
            return Err("too many spotlights".into());
        }
        if let Some(id) = self.spotlights.iter().find(|id| !self.peers.contains_key(*id)) {
            return Err(format!("spotlight {id} is not joined"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaKind, TransportDirection};
    use crate::room::peer::{Consumer, Outbound, ProducerSource, Transport};
    use crate::room::roles::Role;
    use crate::room::spotlight::RecentSpeakers;
    use tokio::sync::mpsc;

    fn room() -> Room {
        Room::new("r".into(), Arc::new(RoomPolicy::default()), Arc::new(RecentSpeakers))
    }

    fn peer(id: &str, roles: &[Role]) -> (Peer, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(16);
        let roles = roles.iter().copied().collect();
        (Peer::new(id.into(), id.to_uppercase(), None, roles, None, tx), rx)
    }

    fn lobby_peer(id: &str) -> LobbyPeer {
        let (tx, _rx) = mpsc::channel(16);
        LobbyPeer {
            id: id.into(),
            display_name: id.to_uppercase(),
            picture: None,
            roles: RoleSet::new(),
            rtp_capabilities: None,
            channel: tx,
        }
    }

    fn with_media(room: &mut Room, peer_id: &str, direction: TransportDirection) -> String {
        let transport_id = format!("t-{peer_id}-{direction:?}");
        room.peers[peer_id].transports.insert(
            transport_id.clone(),
            Transport {
                id: transport_id.clone(),
                direction,
                connected: true,
            },
        );
        transport_id
    }

    fn produce(room: &mut Room, peer_id: &str, producer_id: &str) {
        let transport_id = with_media(room, peer_id, TransportDirection::Send);
        let producer = Producer {
            id: producer_id.into(),
            kind: MediaKind::Audio,
            source: ProducerSource::Mic,
            transport_id,
            paused: false,
        };
        room.add_producer(peer_id, producer, &mut Outbox::default());
    }

    fn consume(room: &mut Room, peer_id: &str, producer_id: &str, consumer_id: &str) {
        let transport_id = with_media(room, peer_id, TransportDirection::Recv);
        let producer_peer_id = room.producer_owner(producer_id).cloned().unwrap();
        room.peers[peer_id].consumers.insert(
            consumer_id.into(),
            Consumer {
                id: consumer_id.into(),
                producer_id: producer_id.into(),
                producer_peer_id,
                transport_id,
                kind: MediaKind::Audio,
                paused: true,
                producer_paused: false,
                current_layers: None,
                preferred_layers: None,
            },
        );
    }

    #[test]
    fn test_admit_announces_to_existing_peers_only() {
        let mut room = room();
        let mut outbox = Outbox::default();
        room.admit(peer("a", &[]).0, &mut outbox);
        let mut outbox = Outbox::default();
        let snapshot = room.admit(peer("b", &[]).0, &mut outbox);

        assert_eq!(snapshot.peers.len(), 1);
        assert_eq!(snapshot.peers[0].id, "a");
        assert!(outbox.addressed_to("b").is_empty());
        assert!(matches!(outbox.addressed_to("a")[0], Notification::NewPeer(info) if info.id == "b"));
        room.verify().unwrap();
    }

    #[test]
    fn test_lobby_visible_only_to_promoters() {
        let mut room = room();
        room.enter_lobby(lobby_peer("waiting"), &mut Outbox::default());

        let moderator = room.admit(peer("m", &[Role::Moderator]).0, &mut Outbox::default());
        let normal = room.admit(peer("n", &[]).0, &mut Outbox::default());

        assert!(normal.lobby_peers.is_empty());
        assert_eq!(moderator.lobby_peers.len(), 1);
    }

    #[test]
    fn test_close_producer_cascades_to_consumers() {
        let mut room = room();
        for id in ["a", "b", "c"] {
            room.admit(peer(id, &[]).0, &mut Outbox::default());
        }
        produce(&mut room, "a", "pa");
        consume(&mut room, "b", "pa", "cb");
        consume(&mut room, "c", "pa", "cc");

        let mut outbox = Outbox::default();
        let closed = room.close_producer("pa", ProducerCloseNotice::Others, &mut outbox).unwrap();

        assert_eq!(
            closed,
            vec![
                MediaObject::Consumer("cb".into()),
                MediaObject::Consumer("cc".into()),
                MediaObject::Producer("pa".into()),
            ]
        );
        assert!(outbox
            .addressed_to("b")
            .iter()
            .any(|n| matches!(n, Notification::ConsumerClosed { consumer_id, .. } if consumer_id == "cb")));
        assert!(outbox.addressed_to("a").is_empty());
        assert!(room.close_producer("pa", ProducerCloseNotice::Others, &mut outbox).is_none());
        room.verify().unwrap();
    }

    #[test]
    fn test_remove_peer_closes_everything_it_touches() {
        let mut room = room();
        for id in ["a", "b"] {
            room.admit(peer(id, &[]).0, &mut Outbox::default());
        }
        produce(&mut room, "a", "pa");
        produce(&mut room, "b", "pb");
        consume(&mut room, "b", "pa", "cb");
        consume(&mut room, "a", "pb", "ca");
        room.record_speech("a", &mut Outbox::default());

        let mut outbox = Outbox::default();
        let closed = room.remove_peer("a", &mut outbox).unwrap();

        assert!(closed.contains(&MediaObject::Consumer("ca".into())));
        assert!(closed.contains(&MediaObject::Consumer("cb".into())));
        assert!(closed.contains(&MediaObject::Producer("pa".into())));
        assert_eq!(room.active_speaker_id, None);
        assert!(room.peers["b"].consumers.is_empty());

        let to_b = outbox.addressed_to("b");
        assert!(matches!(to_b.last(), Some(Notification::PeerClosed { peer_id }) if peer_id == "a"));
        assert!(!to_b.iter().any(|n| matches!(n, Notification::ProducerClosed { .. })));
        assert!(room.remove_peer("a", &mut outbox).is_none());
        room.verify().unwrap();
    }

    #[test]
    fn test_promote_respects_capacity() {
        let policy = RoomPolicy {
            max_peers: 1,
            ..RoomPolicy::default()
        };
        let mut room = Room::new("r".into(), Arc::new(policy), Arc::new(RecentSpeakers));
        room.admit(peer("a", &[Role::Moderator]).0, &mut Outbox::default());
        room.enter_lobby(lobby_peer("w"), &mut Outbox::default());

        let err = room.promote("w", Some("a"), &mut Outbox::default()).unwrap_err();
        assert!(matches!(err, SignalingError::Conflict(_)));
        assert!(room.lobby.contains_key("w"));

        let err = room.promote("ghost", Some("a"), &mut Outbox::default()).unwrap_err();
        assert!(matches!(err, SignalingError::NotFound(_)));
    }

    #[test]
    fn test_promote_sends_room_ready() {
        let mut room = room();
        room.admit(peer("m", &[Role::Moderator]).0, &mut Outbox::default());
        room.enter_lobby(lobby_peer("w"), &mut Outbox::default());

        let mut outbox = Outbox::default();
        room.promote("w", Some("m"), &mut outbox).unwrap();

        assert!(room.peers.contains_key("w"));
        assert!(matches!(outbox.addressed_to("w")[0], Notification::RoomReady(s) if s.peer_id == "w"));
        let to_m = outbox.addressed_to("m");
        assert!(matches!(to_m[0], Notification::LobbyPeerPromoted { .. }));
        assert!(matches!(to_m[1], Notification::NewPeer(_)));
    }

    #[test]
    fn test_speech_drives_spotlights() {
        let policy = RoomPolicy {
            last_n: 1,
            ..RoomPolicy::default()
        };
        let mut room = Room::new("r".into(), Arc::new(policy), Arc::new(RecentSpeakers));
        for id in ["a", "b"] {
            room.admit(peer(id, &[]).0, &mut Outbox::default());
        }
        assert_eq!(room.spotlights, vec!["a".to_string()]);

        let mut outbox = Outbox::default();
        room.record_speech("b", &mut outbox);
        assert_eq!(room.spotlights, vec!["b".to_string()]);
        assert_eq!(room.active_speaker_id.as_deref(), Some("b"));
        assert_eq!(outbox.addressed_to("a").len(), 2);

        let mut outbox = Outbox::default();
        room.record_speech("b", &mut outbox);
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_chat_history_is_bounded() {
        let policy = RoomPolicy {
            chat_history_limit: 2,
            ..RoomPolicy::default()
        };
        let mut room = Room::new("r".into(), Arc::new(policy), Arc::new(RecentSpeakers));
        for n in 0..3 {
            room.push_chat(ChatEntry {
                peer_id: "a".into(),
                display_name: "A".into(),
                text: n.to_string(),
                timestamp: n,
            });
        }
        let snapshot = room.snapshot("a", &RoleSet::new());
        let texts: Vec<_> = snapshot.chat_history.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["1", "2"]);
    }
}
