#![forbid(unsafe_code)]

// Room actor - owns one room and serializes every mutation of it
//
// Commands are applied strictly in arrival order. A turn runs to
// completion, engine calls included, before the next command is taken.
// Notifications recorded during the turn are flushed before its reply.

use super::peer::{Outbound, PeerChannel, PeerId};
use super::permissions::RoleSet;
use super::registry::RoomDirectory;
use super::spotlight::SpotlightPolicy;
use super::state::{Delivery, Outbox, Recipient, Room, RoomId, RoomSummary};
use crate::config::RoomPolicy;
use crate::error::{SignalingError, SignalingResult};
use crate::media::{MediaEngine, MediaEvent};
use crate::signaling::protocol::ClientRequest;
use crate::turn::TurnConfig;
use futures_util::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Buffer for engine events; stale audio levels may be dropped.
const MEDIA_EVENT_BUFFER: usize = 64;

pub type Reply = oneshot::Sender<SignalingResult<Value>>;

/// Everything a room needs from the server, shared by all rooms.
#[derive(Clone)]
pub struct RoomContext {
    pub engine: Arc<dyn MediaEngine>,
    pub policy: Arc<RoomPolicy>,
    pub spotlight: Arc<dyn SpotlightPolicy>,
    pub turn: Option<Arc<TurnConfig>>,
}

/// A validated join attempt.
#[derive(Debug)]
pub struct Admission {
    pub room_id: RoomId,
    pub peer_id: PeerId,
    pub display_name: String,
    pub picture: Option<String>,
    pub roles: RoleSet,
    pub rtp_capabilities: Option<Value>,
    pub channel: PeerChannel,
}

pub enum RoomCommand {
    Join {
        admission: Admission,
        respond_to: Reply,
    },
    Request {
        peer_id: PeerId,
        channel: PeerChannel,
        request: ClientRequest,
        respond_to: Option<Reply>,
    },
    /// The client's connection is gone.
    Disconnect { peer_id: PeerId, channel: PeerChannel },
    #[cfg(test)]
    Verify {
        respond_to: oneshot::Sender<Result<(), String>>,
    },
}

impl RoomCommand {
    fn reject(self, error: SignalingError) {
        match self {
            RoomCommand::Join { respond_to, .. } => {
                let _ = respond_to.send(Err(error));
            }
            RoomCommand::Request {
                respond_to: Some(respond_to),
                ..
            } => {
                let _ = respond_to.send(Err(error));
            }
            #[cfg(test)]
            RoomCommand::Verify { respond_to } => {
                let _ = respond_to.send(Err(error.to_string()));
            }
            _ => {}
        }
    }
}

/// One unit of serialized work.
pub(crate) enum Turn {
    Join(Admission),
    Request {
        peer_id: PeerId,
        channel: PeerChannel,
        request: ClientRequest,
    },
    Disconnect {
        peer_id: PeerId,
        channel: PeerChannel,
    },
    Media(MediaEvent),
}

/// Handle to a running room. Cheap to clone.
#[derive(Clone)]
pub struct RoomHandle {
    id: RoomId,
    incarnation: u64,
    sender: mpsc::UnboundedSender<RoomCommand>,
    summary: watch::Receiver<RoomSummary>,
}

impl RoomHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn send(&self, command: RoomCommand) -> SignalingResult<()> {
        self.sender.send(command).map_err(|rejected| {
            let error = SignalingError::room_closed();
            rejected.0.reject(error.clone());
            error
        })
    }

    /// Enqueues a request; the receiver yields its result.
    pub fn request(
        &self,
        peer_id: PeerId,
        channel: PeerChannel,
        request: ClientRequest,
    ) -> oneshot::Receiver<SignalingResult<Value>> {
        let (tx, rx) = oneshot::channel();
        let _ = self.send(RoomCommand::Request {
            peer_id,
            channel,
            request,
            respond_to: Some(tx),
        });
        rx
    }

    /// Enqueues a request nobody waits for.
    pub fn notify(&self, peer_id: PeerId, channel: PeerChannel, request: ClientRequest) {
        let _ = self.send(RoomCommand::Request {
            peer_id,
            channel,
            request,
            respond_to: None,
        });
    }

    pub fn disconnect(&self, peer_id: PeerId, channel: PeerChannel) {
        let _ = self.send(RoomCommand::Disconnect { peer_id, channel });
    }

    /// State as of the last completed turn.
    pub fn summary(&self) -> RoomSummary {
        self.summary.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    #[cfg(test)]
    pub async fn verify(&self) -> Result<(), String> {
        let (tx, rx) = oneshot::channel();
        self.send(RoomCommand::Verify { respond_to: tx })
            .map_err(|e| e.to_string())?;
        rx.await.map_err(|e| e.to_string())?
    }
}

pub struct RoomActor {
    pub(crate) room: Room,
    pub(crate) router_id: String,
    pub(crate) ctx: RoomContext,
    incarnation: u64,
    directory: RoomDirectory,
    summary: watch::Sender<RoomSummary>,
}

impl RoomActor {
    /// Starts the actor for a new room. The caller must insert the handle
    /// into `directory` before releasing its lock.
    pub fn spawn(
        id: RoomId,
        incarnation: u64,
        ctx: RoomContext,
        directory: RoomDirectory,
    ) -> RoomHandle {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (summary_tx, summary_rx) = watch::channel(RoomSummary {
            id: id.clone(),
            ..RoomSummary::default()
        });

        tokio::spawn(Self::start(
            id.clone(),
            incarnation,
            ctx,
            directory,
            receiver,
            summary_tx,
        ));

        RoomHandle {
            id,
            incarnation,
            sender,
            summary: summary_rx,
        }
    }

    async fn start(
        id: RoomId,
        incarnation: u64,
        ctx: RoomContext,
        directory: RoomDirectory,
        mut receiver: mpsc::UnboundedReceiver<RoomCommand>,
        summary: watch::Sender<RoomSummary>,
    ) {
        let (events_tx, events) = mpsc::channel(MEDIA_EVENT_BUFFER);

        let router = async {
            let router_id = ctx.engine.create_router(&id, events_tx).await?;
            match ctx.engine.rtp_capabilities(&router_id).await {
                Ok(caps) => Ok((router_id, caps)),
                Err(e) => {
                    ctx.engine.close_router(&router_id).await;
                    Err(e)
                }
            }
        };

        let (router_id, caps) = match router.await {
            Ok(created) => created,
            Err(e) => {
                error!("Failed to create router for room {}: {}", id, e);
                let error = SignalingError::from(e);
                {
                    let mut rooms = directory.lock().unwrap_or_else(|e| e.into_inner());
                    if rooms.get(&id).is_some_and(|h| h.incarnation == incarnation) {
                        rooms.remove(&id);
                    }
                    receiver.close();
                }
                while let Ok(command) = receiver.try_recv() {
                    command.reject(error.clone());
                }
                return;
            }
        };

        info!("Created room {} on router {}", id, router_id);
        let mut room = Room::new(id, ctx.policy.clone(), ctx.spotlight.clone());
        room.router_rtp_capabilities = caps;

        let actor = RoomActor {
            room,
            router_id,
            ctx,
            incarnation,
            directory,
            summary,
        };
        actor.run(receiver, events).await;
    }

    async fn run(
        mut self,
        mut receiver: mpsc::UnboundedReceiver<RoomCommand>,
        mut events: mpsc::Receiver<MediaEvent>,
    ) {
        loop {
            tokio::select! {
                command = receiver.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = events.recv() => {
                    self.apply(Turn::Media(event), None).await;
                }
            }

            if self.room.is_empty() && self.try_retire(&mut receiver) {
                break;
            }
        }

        self.ctx.engine.close_router(&self.router_id).await;
        info!("Room {} closed", self.room.id);
    }

    async fn handle_command(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Join { admission, respond_to } => {
                self.apply(Turn::Join(admission), Some(respond_to)).await;
            }
            RoomCommand::Request {
                peer_id,
                channel,
                request,
                respond_to,
            } => {
                let turn = Turn::Request {
                    peer_id,
                    channel,
                    request,
                };
                self.apply(turn, respond_to).await;
            }
            RoomCommand::Disconnect { peer_id, channel } => {
                self.apply(Turn::Disconnect { peer_id, channel }, None).await;
            }
            #[cfg(test)]
            RoomCommand::Verify { respond_to } => {
                let _ = respond_to.send(self.room.verify());
            }
        }
    }

    /// Runs one turn: mutate, flush notifications, reply, publish summary.
    async fn apply(&mut self, turn: Turn, respond_to: Option<Reply>) {
        let mut outbox = Outbox::default();

        let result = AssertUnwindSafe(self.execute(turn, &mut outbox))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(SignalingError::Internal(format!(
                    "room {} turn panicked",
                    self.room.id
                )))
            });

        self.dispatch(outbox);
        self.summary.send_replace(self.room.summary());

        match &result {
            Err(SignalingError::Internal(message)) => {
                error!("Internal error in room {}: {}", self.room.id, message);
            }
            Err(e) if respond_to.is_none() => {
                debug!("Unacknowledged request in room {} failed: {}", self.room.id, e);
            }
            _ => {}
        }
        if let Some(respond_to) = respond_to {
            let _ = respond_to.send(result);
        }
    }

    /// Requests are only honored from the connection that joined as `peer_id`.
    pub(crate) fn check_sender(&self, peer_id: &str, channel: &PeerChannel) -> SignalingResult<()> {
        match self.room.channel_of(peer_id) {
            Some(joined) if joined.same_channel(channel) => Ok(()),
            _ => Err(SignalingError::not_joined()),
        }
    }

    fn dispatch(&self, outbox: Outbox) {
        for delivery in outbox.into_deliveries() {
            match delivery {
                Delivery::Notify { to, notification } => {
                    let json = match serde_json::to_string(&notification) {
                        Ok(j) => Arc::new(j),
                        Err(e) => {
                            warn!("Failed to serialize notification: {}", e);
                            continue;
                        }
                    };
                    for recipient in &to {
                        let (label, channel) = match recipient {
                            Recipient::Peer(id) => match self.room.channel_of(id) {
                                Some(channel) => (id.as_str(), channel),
                                None => continue,
                            },
                            Recipient::Channel(channel) => ("departed peer", channel),
                        };
                        self.deliver(label, channel, Outbound::Text(json.clone()));
                    }
                }
                Delivery::Disconnect(channel) => self.close_channel(channel),
            }
        }
    }

    fn deliver(&self, label: &str, channel: &PeerChannel, frame: Outbound) {
        match channel.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Channel full for {} in room {}, dropping message", label, self.room.id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Channel closed for {} in room {} (disconnected)", label, self.room.id);
            }
        }
    }

    /// Unlike notifications, a close is never dropped: with a full queue it
    /// waits for the connection to drain, off the room's turn.
    fn close_channel(&self, channel: PeerChannel) {
        match channel.try_send(Outbound::Close) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                debug!("Channel full in room {}, queueing close", self.room.id);
                tokio::spawn(async move {
                    let _ = channel.send(frame).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Channel already closed for departed peer in room {}", self.room.id);
            }
        }
    }

    /// Leaves the registry if nothing is queued. Once retired, the mailbox
    /// is closed and anything that raced in is rejected.
    fn try_retire(&self, receiver: &mut mpsc::UnboundedReceiver<RoomCommand>) -> bool {
        {
            let mut rooms = self.directory.lock().unwrap_or_else(|e| e.into_inner());
            if !receiver.is_empty() {
                return false;
            }
            if rooms
                .get(&self.room.id)
                .is_some_and(|h| h.incarnation == self.incarnation)
            {
                rooms.remove(&self.room.id);
            }
            receiver.close();
        }

        while let Ok(command) = receiver.try_recv() {
            command.reject(SignalingError::room_closed());
        }
        true
    }
}
