#![forbid(unsafe_code)]

// Room registry - process-wide map of live rooms
//
// Lookups and inserts happen under one short std lock, never held across
// an await. A room removes itself when it empties, under the same lock,
// so a concurrent join either reaches the live room or creates a new one.

use super::actor::{Admission, RoomActor, RoomCommand, RoomContext, RoomHandle};
use super::spotlight::{RecentSpeakers, SpotlightPolicy};
use super::state::{RoomId, RoomSummary};
use super::{validate_display_name, validate_peer_id, validate_picture, validate_room_id};
use crate::config::RoomPolicy;
use crate::error::SignalingResult;
use crate::media::MediaEngine;
use crate::turn::TurnConfig;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::oneshot;
use tracing::info;

pub(crate) type RoomDirectory = Arc<StdMutex<HashMap<RoomId, RoomHandle>>>;

/// Result of a join, delivered once the room has processed it.
pub type JoinReply = oneshot::Receiver<SignalingResult<Value>>;

#[derive(Clone)]
pub struct RoomRegistry {
    rooms: RoomDirectory,
    ctx: RoomContext,
    next_incarnation: Arc<AtomicU64>,
}

impl RoomRegistry {
    pub fn new(engine: Arc<dyn MediaEngine>, policy: RoomPolicy, turn: Option<TurnConfig>) -> Self {
        Self {
            rooms: Arc::new(StdMutex::new(HashMap::new())),
            ctx: RoomContext {
                engine,
                policy: Arc::new(policy),
                spotlight: Arc::new(RecentSpeakers),
                turn: turn.map(Arc::new),
            },
            next_incarnation: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_spotlight_policy(mut self, spotlight: Arc<dyn SpotlightPolicy>) -> Self {
        self.ctx.spotlight = spotlight;
        self
    }

    pub fn policy(&self) -> &RoomPolicy {
        &self.ctx.policy
    }

    /// Finds or creates the room and queues the join in one step.
    ///
    /// Returns the room handle for follow-up requests and the join reply.
    pub fn join(&self, admission: Admission) -> SignalingResult<(RoomHandle, JoinReply)> {
        validate_room_id(&admission.room_id)?;
        validate_peer_id(&admission.peer_id)?;
        validate_display_name(&admission.display_name)?;
        if let Some(picture) = &admission.picture {
            validate_picture(picture)?;
        }

        let room_id = admission.room_id.clone();
        let (tx, rx) = oneshot::channel();

        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        let handle = match rooms.get(&room_id) {
            Some(handle) if !handle.is_closed() => handle.clone(),
            _ => {
                info!("Creating new room: {}", room_id);
                let incarnation = self.next_incarnation.fetch_add(1, Ordering::Relaxed);
                let handle =
                    RoomActor::spawn(room_id.clone(), incarnation, self.ctx.clone(), self.rooms.clone());
                rooms.insert(room_id, handle.clone());
                handle
            }
        };
        handle.send(RoomCommand::Join {
            admission,
            respond_to: tx,
        })?;
        drop(rooms);

        Ok((handle, rx))
    }

    pub fn get(&self, room_id: &str) -> Option<RoomHandle> {
        let rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        rooms.get(room_id).cloned()
    }

    pub fn room_count(&self) -> usize {
        let rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        rooms.len()
    }

    /// Joined peers across all rooms, as of each room's last turn.
    pub fn total_peer_count(&self) -> usize {
        let rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        rooms.values().map(|room| room.summary().peers.len()).sum()
    }

    pub fn summary(&self, room_id: &str) -> Option<RoomSummary> {
        self.get(room_id).map(|room| room.summary())
    }
}
