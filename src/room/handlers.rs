#![forbid(unsafe_code)]

// Room turn handlers - one function per signaling method
//
// Every handler runs inside the room actor's turn with exclusive access to
// the graph. Validation happens before the first engine call so a rejected
// request leaves nothing behind.

use super::actor::{Admission, RoomActor, Turn};
use super::peer::{Consumer, LobbyPeer, Peer, Producer, ProducerSource, Transport};
use super::roles::{Access, Permission, Role};
use super::state::{Outbox, ProducerCloseNotice};
use super::{validate_chat, validate_display_name, validate_magnet_uri, validate_picture};
use crate::error::{SignalingError, SignalingResult};
use crate::media::{Layers, MediaEvent, MediaKind, MediaObject, TransportDirection};
use crate::signaling::protocol::{
    ChatEntry, ClientRequest, FileEntry, JoinOutcome, Notification, RoleOp, TransportCreated,
};
use crate::turn::ice_servers;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

const MIC: &[ProducerSource] = &[ProducerSource::Mic];
const VIDEO: &[ProducerSource] = &[ProducerSource::Webcam, ProducerSource::ExtraVideo];
const SCREEN: &[ProducerSource] = &[ProducerSource::Screen];

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn not_found(what: &str, id: &str) -> SignalingError {
    SignalingError::NotFound(format!("{what} {id} not found"))
}

fn ack() -> SignalingResult<Value> {
    Ok(json!({}))
}

fn to_value<T: Serialize>(value: &T) -> SignalingResult<Value> {
    serde_json::to_value(value).map_err(|e| SignalingError::Internal(e.to_string()))
}

fn required_permission(source: ProducerSource) -> Permission {
    match source {
        ProducerSource::Mic => Permission::ShareAudio,
        ProducerSource::Webcam => Permission::ShareVideo,
        ProducerSource::Screen => Permission::ShareScreen,
        ProducerSource::ExtraVideo => Permission::ExtraVideo,
        ProducerSource::Data => Permission::ShareFile,
    }
}

impl RoomActor {
    pub(crate) async fn execute(&mut self, turn: Turn, outbox: &mut Outbox) -> SignalingResult<Value> {
        match turn {
            Turn::Join(admission) => self.join(admission, outbox),
            Turn::Request {
                peer_id,
                channel,
                request,
            } => {
                self.check_sender(&peer_id, &channel)?;
                self.handle_request(&peer_id, request, outbox).await
            }
            Turn::Disconnect { peer_id, channel } => {
                if self.check_sender(&peer_id, &channel).is_ok() {
                    info!("Peer {} disconnected from room {}", peer_id, self.room.id);
                    self.leave(&peer_id, outbox).await;
                }
                Ok(Value::Null)
            }
            Turn::Media(event) => {
                self.on_media_event(event, outbox);
                Ok(Value::Null)
            }
        }
    }

    async fn handle_request(
        &mut self,
        peer_id: &str,
        request: ClientRequest,
        outbox: &mut Outbox,
    ) -> SignalingResult<Value> {
        match request {
            ClientRequest::Join { .. } => Err(SignalingError::Conflict(format!(
                "peer {peer_id} already joined room {}",
                self.room.id
            ))),
            ClientRequest::Leave {} => {
                self.leave(peer_id, outbox).await;
                ack()
            }
            ClientRequest::GetRouterRtpCapabilities {} => {
                self.room.peer(peer_id)?;
                Ok(self.room.router_rtp_capabilities.clone())
            }
            ClientRequest::CreateTransport { direction } => {
                self.create_transport(peer_id, direction).await
            }
            ClientRequest::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => self.connect_transport(peer_id, &transport_id, dtls_parameters).await,
            ClientRequest::RestartIce { transport_id } => {
                self.owned_transport(peer_id, &transport_id)?;
                let ice_parameters = self.ctx.engine.restart_ice(&transport_id).await?;
                Ok(json!({ "iceParameters": ice_parameters }))
            }
            ClientRequest::Produce {
                transport_id,
                kind,
                rtp_parameters,
                source,
                paused,
            } => {
                self.produce(peer_id, transport_id, kind, rtp_parameters, source, paused, outbox)
                    .await
            }
            ClientRequest::Consume {
                producer_id,
                rtp_capabilities,
                transport_id,
            } => self.consume(peer_id, producer_id, rtp_capabilities, transport_id).await,
            ClientRequest::CloseProducer { producer_id } => {
                self.owned_producer(peer_id, &producer_id)?;
                if let Some(objects) =
                    self.room
                        .close_producer(&producer_id, ProducerCloseNotice::Others, outbox)
                {
                    self.close_objects(objects).await;
                }
                ack()
            }
            ClientRequest::PauseProducer { producer_id } => {
                self.set_producer_paused(peer_id, &producer_id, true, outbox).await
            }
            ClientRequest::ResumeProducer { producer_id } => {
                self.set_producer_paused(peer_id, &producer_id, false, outbox).await
            }
            ClientRequest::PauseConsumer { consumer_id } => {
                self.set_consumer_paused(peer_id, &consumer_id, true).await
            }
            ClientRequest::ResumeConsumer { consumer_id } => {
                self.set_consumer_paused(peer_id, &consumer_id, false).await
            }
            ClientRequest::SetConsumerPreferredLayers {
                consumer_id,
                spatial_layer,
                temporal_layer,
            } => {
                self.owned_consumer(peer_id, &consumer_id)?;
                let layers = Layers {
                    spatial_layer,
                    temporal_layer,
                };
                self.ctx.engine.set_preferred_layers(&consumer_id, layers).await?;
                if let Some(consumer) = self
                    .room
                    .peers
                    .get_mut(peer_id)
                    .and_then(|peer| peer.consumers.get_mut(&consumer_id))
                {
                    consumer.preferred_layers = Some(layers);
                }
                ack()
            }
            ClientRequest::GetTransportStats { transport_id } => {
                self.owned_transport(peer_id, &transport_id)?;
                Ok(self.ctx.engine.stats(&MediaObject::Transport(transport_id)).await?)
            }
            ClientRequest::GetProducerStats { producer_id } => {
                self.owned_producer(peer_id, &producer_id)?;
                Ok(self.ctx.engine.stats(&MediaObject::Producer(producer_id)).await?)
            }
            ClientRequest::GetConsumerStats { consumer_id } => {
                self.owned_consumer(peer_id, &consumer_id)?;
                Ok(self.ctx.engine.stats(&MediaObject::Consumer(consumer_id)).await?)
            }
            ClientRequest::SetRoomLock { locked } => self.set_room_lock(peer_id, locked, outbox),
            ClientRequest::PromotePeer { peer_id: target } => {
                self.room.require(peer_id, Permission::PromotePeer)?;
                self.room.promote(&target, Some(peer_id), outbox)?;
                ack()
            }
            ClientRequest::PromoteAllPeers {} => self.promote_all(peer_id, outbox),
            ClientRequest::ChangeRole {
                peer_id: target,
                role,
                op,
            } => self.change_role(peer_id, &target, role, op, outbox),
            ClientRequest::KickPeer { peer_id: target } => {
                self.room.require(peer_id, Permission::ModerateRoom)?;
                if target == peer_id {
                    return Err(SignalingError::Validation("cannot kick yourself".into()));
                }
                if !self.kick(&target, outbox).await {
                    return Err(not_found("peer", &target));
                }
                ack()
            }
            ClientRequest::RaiseHand { flag } => {
                {
                    let peer = self.room.peer_mut(peer_id)?;
                    if peer.raised_hand == flag {
                        return ack();
                    }
                    peer.raised_hand = flag;
                }
                outbox.notify_all(
                    self.room.others(peer_id),
                    Notification::RaisedHand {
                        peer_id: peer_id.to_string(),
                        raised_hand: flag,
                    },
                );
                ack()
            }
            ClientRequest::LowerHand { peer_id: target } => {
                self.room.require(peer_id, Permission::ModerateRoom)?;
                let peer = self
                    .room
                    .peers
                    .get_mut(&target)
                    .ok_or_else(|| not_found("peer", &target))?;
                if peer.raised_hand {
                    peer.raised_hand = false;
                    outbox.notify_all(
                        self.room.everyone(),
                        Notification::RaisedHand {
                            peer_id: target,
                            raised_hand: false,
                        },
                    );
                }
                ack()
            }
            ClientRequest::ChangeDisplayName { display_name } => {
                self.change_display_name(peer_id, display_name, outbox)
            }
            ClientRequest::ChangePicture { picture } => self.change_picture(peer_id, picture, outbox),
            ClientRequest::ChatMessage { text } => {
                self.room.require(peer_id, Permission::SendChat)?;
                validate_chat(&text)?;
                let entry = ChatEntry {
                    peer_id: peer_id.to_string(),
                    display_name: self.room.peer(peer_id)?.display_name.clone(),
                    text,
                    timestamp: now_millis(),
                };
                self.room.push_chat(entry.clone());
                outbox.notify_all(self.room.others(peer_id), Notification::ChatMessage(entry));
                ack()
            }
            ClientRequest::ClearChat {} => {
                self.room.require(peer_id, Permission::ModerateChat)?;
                self.room.clear_chat();
                outbox.notify_all(
                    self.room.everyone(),
                    Notification::ChatCleared {
                        peer_id: peer_id.to_string(),
                    },
                );
                ack()
            }
            ClientRequest::SendFile { magnet_uri } => {
                self.room.require(peer_id, Permission::ShareFile)?;
                validate_magnet_uri(&magnet_uri)?;
                let entry = FileEntry {
                    peer_id: peer_id.to_string(),
                    display_name: self.room.peer(peer_id)?.display_name.clone(),
                    magnet_uri,
                    timestamp: now_millis(),
                };
                self.room.push_file(entry.clone());
                outbox.notify_all(self.room.others(peer_id), Notification::SendFile(entry));
                ack()
            }
            ClientRequest::ClearFileSharing {} => {
                self.room.require(peer_id, Permission::ModerateFiles)?;
                self.room.clear_files();
                outbox.notify_all(
                    self.room.everyone(),
                    Notification::FilesCleared {
                        peer_id: peer_id.to_string(),
                    },
                );
                ack()
            }
            ClientRequest::Mute { peer_id: target } => {
                self.moderate_sources(peer_id, Some(&target), MIC, outbox).await
            }
            ClientRequest::StopVideo { peer_id: target } => {
                self.moderate_sources(peer_id, Some(&target), VIDEO, outbox).await
            }
            ClientRequest::StopScreenSharing { peer_id: target } => {
                self.moderate_sources(peer_id, Some(&target), SCREEN, outbox).await
            }
            ClientRequest::MuteAll {} => self.moderate_sources(peer_id, None, MIC, outbox).await,
            ClientRequest::StopAllVideo {} => self.moderate_sources(peer_id, None, VIDEO, outbox).await,
            ClientRequest::StopAllScreenSharing {} => {
                self.moderate_sources(peer_id, None, SCREEN, outbox).await
            }
            ClientRequest::CloseMeeting {} => {
                self.room.require(peer_id, Permission::ModerateRoom)?;
                let targets: Vec<String> = self
                    .room
                    .others(peer_id)
                    .into_iter()
                    .chain(self.room.lobby.keys().cloned())
                    .collect();
                for target in &targets {
                    self.kick(target, outbox).await;
                }
                info!("Peer {} closed the meeting in room {}", peer_id, self.room.id);
                ack()
            }
        }
    }

    fn join(&mut self, admission: Admission, outbox: &mut Outbox) -> SignalingResult<Value> {
        let Admission {
            peer_id,
            display_name,
            picture,
            roles,
            rtp_capabilities,
            channel,
            ..
        } = admission;

        if self.room.channel_of(&peer_id).is_some() {
            return Err(SignalingError::Conflict(format!(
                "peer {peer_id} is already in room {}",
                self.room.id
            )));
        }

        if self.room.locked && self.room.peers.is_empty() && self.room.policy().unlock_on_first_join {
            self.room.locked = false;
            info!("Room {} unlocked for its first peer {}", self.room.id, peer_id);
        }

        let peer = Peer::new(peer_id, display_name, picture, roles, rtp_capabilities, channel);
        let bypass = self.room.has_access(&peer.roles, Access::BypassRoomLock)
            || self.room.has_access(&peer.roles, Access::BypassLobby);
        if self.room.locked && !bypass {
            self.room.enter_lobby(LobbyPeer::from(peer), outbox);
            return to_value(&JoinOutcome::Lobby {});
        }

        if self.room.is_full() {
            return Err(SignalingError::Conflict(format!("room {} is full", self.room.id)));
        }

        let snapshot = self.room.admit(peer, outbox);
        to_value(&JoinOutcome::Joined(snapshot))
    }

    /// Removes a joined or waiting peer. A peer that is already gone is a no-op.
    pub(crate) async fn leave(&mut self, peer_id: &str, outbox: &mut Outbox) {
        match self.room.remove_peer(peer_id, outbox) {
            Some(objects) => self.close_objects(objects).await,
            None => {
                self.room.remove_lobby_peer(peer_id, outbox);
            }
        }
    }

    /// Kicks a joined or waiting peer; returns whether it was present.
    async fn kick(&mut self, target: &str, outbox: &mut Outbox) -> bool {
        let Some(channel) = self.room.channel_of(target).cloned() else {
            return false;
        };
        outbox.notify_channel(channel.clone(), Notification::Kicked {});
        self.leave(target, outbox).await;
        outbox.disconnect(channel);
        info!("Peer {} kicked from room {}", target, self.room.id);
        true
    }

    async fn close_objects(&self, objects: Vec<MediaObject>) {
        for object in &objects {
            self.ctx.engine.close(object).await;
        }
    }

    fn owned_transport(&self, peer_id: &str, transport_id: &str) -> SignalingResult<&Transport> {
        self.room
            .peer(peer_id)?
            .transports
            .get(transport_id)
            .ok_or_else(|| not_found("transport", transport_id))
    }

    fn owned_producer(&self, peer_id: &str, producer_id: &str) -> SignalingResult<&Producer> {
        self.room
            .peer(peer_id)?
            .producers
            .get(producer_id)
            .ok_or_else(|| not_found("producer", producer_id))
    }

    fn owned_consumer(&self, peer_id: &str, consumer_id: &str) -> SignalingResult<&Consumer> {
        self.room
            .peer(peer_id)?
            .consumers
            .get(consumer_id)
            .ok_or_else(|| not_found("consumer", consumer_id))
    }

    async fn create_transport(
        &mut self,
        peer_id: &str,
        direction: TransportDirection,
    ) -> SignalingResult<Value> {
        let peer = self.room.peer(peer_id)?;
        if peer.transports.values().any(|t| t.direction == direction) {
            return Err(SignalingError::Conflict(format!(
                "a {} transport already exists",
                direction.as_str()
            )));
        }

        let params = self
            .ctx
            .engine
            .create_webrtc_transport(&self.router_id, direction)
            .await?;
        info!(
            "Created {} transport {} for peer {}",
            direction.as_str(),
            params.id,
            peer_id
        );

        self.room.peer_mut(peer_id)?.transports.insert(
            params.id.clone(),
            Transport {
                id: params.id.clone(),
                direction,
                connected: false,
            },
        );

        to_value(&TransportCreated {
            params,
            direction,
            ice_servers: ice_servers(self.ctx.turn.as_deref(), peer_id),
        })
    }

    async fn connect_transport(
        &mut self,
        peer_id: &str,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> SignalingResult<Value> {
        if self.owned_transport(peer_id, transport_id)?.connected {
            return Err(SignalingError::Conflict(format!(
                "transport {transport_id} is already connected"
            )));
        }
        self.ctx
            .engine
            .connect_transport(transport_id, dtls_parameters)
            .await?;
        if let Some(transport) = self
            .room
            .peers
            .get_mut(peer_id)
            .and_then(|peer| peer.transports.get_mut(transport_id))
        {
            transport.connected = true;
        }
        ack()
    }

    #[allow(clippy::too_many_arguments)]
    async fn produce(
        &mut self,
        peer_id: &str,
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: Value,
        source: Option<ProducerSource>,
        paused: bool,
        outbox: &mut Outbox,
    ) -> SignalingResult<Value> {
        let source = source.unwrap_or_else(|| ProducerSource::default_for(kind));
        if !source.matches(kind) {
            return Err(SignalingError::Validation(format!(
                "source {source:?} cannot carry {kind:?} media"
            )));
        }
        self.room.require(peer_id, required_permission(source))?;
        if self.owned_transport(peer_id, &transport_id)?.direction != TransportDirection::Send {
            return Err(SignalingError::Validation(format!(
                "transport {transport_id} is not a send transport"
            )));
        }

        let producer_id = self
            .ctx
            .engine
            .produce(&transport_id, kind, rtp_parameters, paused)
            .await?;
        info!("Created {:?} producer {} for peer {}", kind, producer_id, peer_id);

        let producer = Producer {
            id: producer_id.clone(),
            kind,
            source,
            transport_id,
            paused,
        };
        self.room.add_producer(peer_id, producer, outbox);
        Ok(json!({ "producerId": producer_id }))
    }

    async fn consume(
        &mut self,
        peer_id: &str,
        producer_id: String,
        rtp_capabilities: Option<Value>,
        transport_id: Option<String>,
    ) -> SignalingResult<Value> {
        let owner_id = self
            .room
            .producer_owner(&producer_id)
            .cloned()
            .ok_or_else(|| not_found("producer", &producer_id))?;
        if owner_id == peer_id {
            return Err(SignalingError::Validation("cannot consume your own producer".into()));
        }

        let peer = self.room.peer(peer_id)?;
        if peer.consumers.values().any(|c| c.producer_id == producer_id) {
            return Err(SignalingError::Conflict(format!(
                "already consuming producer {producer_id}"
            )));
        }
        if peer.consumers.len() >= self.room.policy().max_consumers_per_peer {
            return Err(SignalingError::Conflict("consumer limit reached".into()));
        }

        let transport_id = match transport_id {
            Some(id) => {
                let transport = peer
                    .transports
                    .get(&id)
                    .ok_or_else(|| not_found("transport", &id))?;
                if transport.direction != TransportDirection::Recv {
                    return Err(SignalingError::Validation(format!(
                        "transport {id} is not a receive transport"
                    )));
                }
                id
            }
            None => peer
                .recv_transport()
                .map(|t| t.id.clone())
                .ok_or_else(|| SignalingError::Validation("no receive transport".into()))?,
        };
        let rtp_capabilities = rtp_capabilities
            .or_else(|| peer.rtp_capabilities.clone())
            .ok_or_else(|| SignalingError::Validation("rtpCapabilities are required".into()))?;

        let producer_paused = self
            .room
            .peers
            .get(&owner_id)
            .and_then(|owner| owner.producers.get(&producer_id))
            .is_some_and(|producer| producer.paused);

        let params = self
            .ctx
            .engine
            .consume(&transport_id, &producer_id, rtp_capabilities)
            .await?;
        debug!("Created consumer {} of producer {} for peer {}", params.id, producer_id, peer_id);

        let consumer = Consumer {
            id: params.id.clone(),
            producer_id: producer_id.clone(),
            producer_peer_id: owner_id.clone(),
            transport_id,
            kind: params.kind,
            paused: true,
            producer_paused,
            current_layers: None,
            preferred_layers: None,
        };
        self.room
            .peer_mut(peer_id)?
            .consumers
            .insert(consumer.id.clone(), consumer);

        Ok(json!({
            "consumerId": params.id,
            "producerId": producer_id,
            "peerId": owner_id,
            "kind": params.kind,
            "rtpParameters": params.rtp_parameters,
            "producerPaused": producer_paused,
            "paused": true,
        }))
    }

    async fn set_producer_paused(
        &mut self,
        peer_id: &str,
        producer_id: &str,
        paused: bool,
        outbox: &mut Outbox,
    ) -> SignalingResult<Value> {
        if self.owned_producer(peer_id, producer_id)?.paused == paused {
            return ack();
        }
        let object = MediaObject::Producer(producer_id.to_string());
        if paused {
            self.ctx.engine.pause(&object).await?;
        } else {
            self.ctx.engine.resume(&object).await?;
        }

        if let Some(producer) = self
            .room
            .peers
            .get_mut(peer_id)
            .and_then(|peer| peer.producers.get_mut(producer_id))
        {
            producer.paused = paused;
        }
        for peer in self.room.peers.values_mut() {
            for consumer in peer.consumers.values_mut() {
                if consumer.producer_id != producer_id {
                    continue;
                }
                consumer.producer_paused = paused;
                let consumer_id = consumer.id.clone();
                let notification = if paused {
                    Notification::ConsumerPaused { consumer_id }
                } else {
                    Notification::ConsumerResumed { consumer_id }
                };
                outbox.notify(&peer.id, notification);
            }
        }

        let (peer_id_owned, producer_id_owned) = (peer_id.to_string(), producer_id.to_string());
        let notification = if paused {
            Notification::ProducerPaused {
                peer_id: peer_id_owned,
                producer_id: producer_id_owned,
            }
        } else {
            Notification::ProducerResumed {
                peer_id: peer_id_owned,
                producer_id: producer_id_owned,
            }
        };
        outbox.notify_all(self.room.others(peer_id), notification);
        ack()
    }

    async fn set_consumer_paused(
        &mut self,
        peer_id: &str,
        consumer_id: &str,
        paused: bool,
    ) -> SignalingResult<Value> {
        if self.owned_consumer(peer_id, consumer_id)?.paused == paused {
            return ack();
        }
        let object = MediaObject::Consumer(consumer_id.to_string());
        if paused {
            self.ctx.engine.pause(&object).await?;
        } else {
            self.ctx.engine.resume(&object).await?;
        }
        if let Some(consumer) = self
            .room
            .peers
            .get_mut(peer_id)
            .and_then(|peer| peer.consumers.get_mut(consumer_id))
        {
            consumer.paused = paused;
        }
        ack()
    }

    fn set_room_lock(&mut self, peer_id: &str, locked: bool, outbox: &mut Outbox) -> SignalingResult<Value> {
        self.room.require(peer_id, Permission::ChangeRoomLock)?;
        if self.room.locked == locked {
            return ack();
        }
        self.room.locked = locked;

        let peer_id_owned = peer_id.to_string();
        let notification = if locked {
            Notification::RoomLocked { peer_id: peer_id_owned }
        } else {
            Notification::RoomUnlocked { peer_id: peer_id_owned }
        };
        outbox.notify_all(self.room.others(peer_id), notification);
        info!(
            "Room {} {} by {}",
            self.room.id,
            if locked { "locked" } else { "unlocked" },
            peer_id
        );
        ack()
    }

    fn promote_all(&mut self, peer_id: &str, outbox: &mut Outbox) -> SignalingResult<Value> {
        self.room.require(peer_id, Permission::PromotePeer)?;
        let waiting: Vec<String> = self.room.lobby.keys().cloned().collect();

        let mut promoted = 0;
        for lobby_peer_id in &waiting {
            if let Err(e) = self.room.promote(lobby_peer_id, Some(peer_id), outbox) {
                debug!("Stopped promoting lobby of room {}: {}", self.room.id, e);
                break;
            }
            promoted += 1;
        }
        Ok(json!({ "promoted": promoted }))
    }

    fn change_role(
        &mut self,
        peer_id: &str,
        target: &str,
        role: Role,
        op: RoleOp,
        outbox: &mut Outbox,
    ) -> SignalingResult<Value> {
        self.room.require(peer_id, Permission::ModifyRole)?;
        if !role.promotable() {
            return Err(SignalingError::Validation(format!(
                "role {} cannot be granted or revoked",
                role.name()
            )));
        }
        if self.room.peer(peer_id)?.max_level() < role.level() {
            return Err(SignalingError::PermissionDenied(format!(
                "role {} outranks the requester",
                role.name()
            )));
        }

        let peer = self
            .room
            .peers
            .get_mut(target)
            .ok_or_else(|| not_found("peer", target))?;
        let changed = match op {
            RoleOp::Add => peer.roles.insert(role),
            RoleOp::Remove => peer.roles.remove(&role),
        };
        if !changed {
            return Err(match op {
                RoleOp::Add => SignalingError::Conflict(format!(
                    "peer {target} already holds role {}",
                    role.name()
                )),
                RoleOp::Remove => SignalingError::NotFound(format!(
                    "peer {target} does not hold role {}",
                    role.name()
                )),
            });
        }

        outbox.notify_all(
            self.room.everyone(),
            Notification::RoleChanged {
                peer_id: target.to_string(),
                role,
                op,
            },
        );
        info!("Peer {} {:?} role {} on {}", peer_id, op, role.name(), target);
        ack()
    }

    fn change_display_name(
        &mut self,
        peer_id: &str,
        display_name: String,
        outbox: &mut Outbox,
    ) -> SignalingResult<Value> {
        validate_display_name(&display_name)?;

        if let Some(peer) = self.room.peers.get_mut(peer_id) {
            if peer.display_name == display_name {
                return ack();
            }
            let old_display_name = std::mem::replace(&mut peer.display_name, display_name.clone());
            outbox.notify_all(
                self.room.others(peer_id),
                Notification::DisplayNameChanged {
                    peer_id: peer_id.to_string(),
                    display_name,
                    old_display_name,
                },
            );
            return ack();
        }

        let lobby_peer = self
            .room
            .lobby
            .get_mut(peer_id)
            .ok_or_else(SignalingError::not_joined)?;
        lobby_peer.display_name = display_name.clone();
        outbox.notify_all(
            self.room.holders_of(Permission::PromotePeer),
            Notification::LobbyPeerDisplayNameChanged {
                peer_id: peer_id.to_string(),
                display_name,
            },
        );
        ack()
    }

    fn change_picture(&mut self, peer_id: &str, picture: String, outbox: &mut Outbox) -> SignalingResult<Value> {
        validate_picture(&picture)?;

        if let Some(peer) = self.room.peers.get_mut(peer_id) {
            peer.picture = Some(picture.clone());
            outbox.notify_all(
                self.room.others(peer_id),
                Notification::PictureChanged {
                    peer_id: peer_id.to_string(),
                    picture,
                },
            );
            return ack();
        }

        let lobby_peer = self
            .room
            .lobby
            .get_mut(peer_id)
            .ok_or_else(SignalingError::not_joined)?;
        lobby_peer.picture = Some(picture.clone());
        outbox.notify_all(
            self.room.holders_of(Permission::PromotePeer),
            Notification::LobbyPeerPictureChanged {
                peer_id: peer_id.to_string(),
                picture,
            },
        );
        ack()
    }

    /// Closes the target's producers of the given sources, or every other
    /// peer's when `target` is `None`.
    async fn moderate_sources(
        &mut self,
        peer_id: &str,
        target: Option<&str>,
        sources: &[ProducerSource],
        outbox: &mut Outbox,
    ) -> SignalingResult<Value> {
        self.room.require(peer_id, Permission::ModerateRoom)?;
        let targets = match target {
            Some(target) => {
                self.room.peer(target).map_err(|_| not_found("peer", target))?;
                vec![target.to_string()]
            }
            None => self.room.others(peer_id),
        };

        let producer_ids: Vec<String> = targets
            .iter()
            .filter_map(|id| self.room.peers.get(id))
            .flat_map(|peer| peer.producers.values())
            .filter(|producer| sources.contains(&producer.source))
            .map(|producer| producer.id.clone())
            .collect();

        let mut objects = Vec::new();
        for producer_id in &producer_ids {
            if let Some(closed) =
                self.room
                    .close_producer(producer_id, ProducerCloseNotice::Everyone, outbox)
            {
                objects.extend(closed);
            }
        }
        self.close_objects(objects).await;

        Ok(json!({ "closed": producer_ids.len() }))
    }

    fn on_media_event(&mut self, event: MediaEvent, outbox: &mut Outbox) {
        match event {
            MediaEvent::AudioLevel { producer_id, volume } => {
                if volume < self.room.policy().speaker_threshold {
                    return;
                }
                if let Some(owner) = self.room.producer_owner(&producer_id).cloned() {
                    self.room.record_speech(&owner, outbox);
                }
            }
            MediaEvent::DominantSpeaker { producer_id } => {
                if let Some(owner) = self.room.producer_owner(&producer_id).cloned() {
                    self.room.record_speech(&owner, outbox);
                }
            }
            MediaEvent::Silence => self.room.clear_active_speaker(outbox),
            MediaEvent::ConsumerLayersChanged { consumer_id, layers } => {
                for peer in self.room.peers.values_mut() {
                    let Some(consumer) = peer.consumers.get_mut(&consumer_id) else {
                        continue;
                    };
                    consumer.current_layers = layers;
                    outbox.notify(
                        &peer.id,
                        Notification::ConsumerLayersChanged {
                            consumer_id: consumer_id.clone(),
                            spatial_layer: layers.map(|l| l.spatial_layer),
                            temporal_layer: layers.and_then(|l| l.temporal_layer),
                        },
                    );
                    break;
                }
            }
        }
    }
}
