#![forbid(unsafe_code)]

// Session - request/response dispatch for one signaling channel
//
// Every request is forwarded into its room's mailbox and awaited for at
// most the request timeout. A timed-out request keeps running in the room;
// its reply is parked under the correlation id so a retry picks it up
// instead of executing twice.

use super::protocol::{ClientRequest, CorrelationId, Inbound, Rejected, Response};
use crate::auth::Authenticator;
use crate::error::{SignalingError, SignalingResult};
use crate::room::permissions::RoleSet;
use crate::room::{Admission, PeerChannel, PeerId, RoomHandle, RoomRegistry};
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tracing::{debug, info, warn};

/// Answered requests remembered per channel for idempotent retries.
pub const RESPONSE_CACHE_SIZE: usize = 64;

const DEFAULT_DISPLAY_NAME: &str = "Guest";

struct Membership {
    room: RoomHandle,
    peer_id: PeerId,
}

/// What a reply means for the session once it arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Effect {
    None,
    Join,
    Leave,
}

struct Pending {
    reply: oneshot::Receiver<SignalingResult<Value>>,
    effect: Effect,
}

pub struct Session {
    registry: RoomRegistry,
    authenticator: Arc<dyn Authenticator>,
    channel: PeerChannel,
    request_timeout: Duration,
    /// Set as soon as a join is queued; cleared if the join fails.
    membership: Option<Membership>,
    pending: IndexMap<CorrelationId, Pending>,
    answered: IndexMap<CorrelationId, Response>,
}

impl Session {
    pub fn new(
        registry: RoomRegistry,
        authenticator: Arc<dyn Authenticator>,
        channel: PeerChannel,
        request_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            authenticator,
            channel,
            request_timeout,
            membership: None,
            pending: IndexMap::new(),
            answered: IndexMap::new(),
        }
    }

    pub fn peer_id(&self) -> Option<&str> {
        self.membership.as_ref().map(|m| m.peer_id.as_str())
    }

    pub fn room_id(&self) -> Option<&str> {
        self.membership.as_ref().map(|m| m.room.id())
    }

    fn label(&self) -> &str {
        self.peer_id().unwrap_or("<unjoined>")
    }

    /// Handles one text frame. Returns the response to send, if the frame
    /// was a request.
    pub async fn handle_text(&mut self, text: &str) -> Option<Response> {
        self.reap();

        let Inbound {
            correlation_id,
            method,
            request,
        } = match Inbound::parse(text) {
            Ok(inbound) => inbound,
            Err(Rejected {
                correlation_id: Some(correlation_id),
                error,
            }) => {
                debug!("Malformed request {} from {}: {}", correlation_id, self.label(), error);
                return Some(Response::failure(correlation_id, &error));
            }
            Err(Rejected { error, .. }) => {
                warn!("Dropping malformed frame from {}: {}", self.label(), error);
                return None;
            }
        };

        let Some(correlation_id) = correlation_id else {
            match request {
                Ok(request) => self.handle_notification(request).await,
                Err(e) => debug!("Ignoring invalid {} notification from {}: {}", method, self.label(), e),
            }
            return None;
        };

        if let Some(response) = self.answered.get(&correlation_id) {
            debug!("Replaying response {} for {}", correlation_id, method);
            return Some(response.clone());
        }

        let result = match self.pending.shift_remove(&correlation_id) {
            Some(pending) => {
                debug!("Retry of {} {} is still pending, waiting again", method, correlation_id);
                self.wait(Some(&correlation_id), pending).await
            }
            None => match request {
                Ok(request) => match self.start(request).await {
                    Ok(pending) => self.wait(Some(&correlation_id), pending).await,
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            },
        };

        if let Err(e) = &result {
            debug!("{} {} from {} failed: {}", method, correlation_id, self.label(), e);
        }
        let response = Response::from_result(correlation_id.clone(), &result);
        if result != Err(SignalingError::Timeout) {
            self.remember(correlation_id, response.clone());
        }
        Some(response)
    }

    /// The channel is gone: the room runs the leave cascade for this peer.
    pub fn close(&mut self) {
        if let Some(membership) = self.membership.take() {
            info!(
                "Channel for {} closed, leaving room {}",
                membership.peer_id,
                membership.room.id()
            );
            membership.room.disconnect(membership.peer_id, self.channel.clone());
        }
    }

    async fn handle_notification(&mut self, request: ClientRequest) {
        if matches!(request, ClientRequest::Join { .. }) {
            let result = match self.start(request).await {
                Ok(pending) => self.wait(None, pending).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                debug!("Join notification failed: {}", e);
            }
            return;
        }

        let Some(membership) = &self.membership else {
            debug!("Ignoring notification from a channel that has not joined");
            return;
        };
        let leaving = matches!(request, ClientRequest::Leave {});
        membership
            .room
            .notify(membership.peer_id.clone(), self.channel.clone(), request);
        if leaving {
            self.membership = None;
        }
    }

    async fn start(&mut self, request: ClientRequest) -> SignalingResult<Pending> {
        let request = match request {
            ClientRequest::Join {
                room_id,
                peer_id,
                display_name,
                picture,
                rtp_capabilities,
                token,
            } => {
                return self
                    .start_join(room_id, peer_id, display_name, picture, rtp_capabilities, token)
                    .await
            }
            request => request,
        };

        let membership = self.membership.as_ref().ok_or_else(SignalingError::not_joined)?;
        let effect = if matches!(request, ClientRequest::Leave {}) {
            Effect::Leave
        } else {
            Effect::None
        };
        let reply = membership
            .room
            .request(membership.peer_id.clone(), self.channel.clone(), request);
        Ok(Pending { reply, effect })
    }

    async fn start_join(
        &mut self,
        room_id: String,
        peer_id: String,
        display_name: Option<String>,
        picture: Option<String>,
        rtp_capabilities: Option<Value>,
        token: Option<String>,
    ) -> SignalingResult<Pending> {
        if let Some(membership) = &self.membership {
            return Err(SignalingError::Conflict(format!(
                "already joined room {}",
                membership.room.id()
            )));
        }

        let identity = self
            .authenticator
            .verify(token.as_deref())
            .await
            .map_err(|e| SignalingError::PermissionDenied(e.to_string()))?;

        let roles: RoleSet = identity.roles.into_iter().collect();
        let display_name = display_name
            .or(identity.display_name)
            .unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_string());

        let admission = Admission {
            room_id,
            peer_id: peer_id.clone(),
            display_name,
            picture,
            roles,
            rtp_capabilities,
            channel: self.channel.clone(),
        };
        let (room, reply) = self.registry.join(admission)?;
        info!("Peer {} joining room {}", peer_id, room.id());
        self.membership = Some(Membership { room, peer_id });

        Ok(Pending {
            reply,
            effect: Effect::Join,
        })
    }

    async fn wait(
        &mut self,
        correlation_id: Option<&CorrelationId>,
        mut pending: Pending,
    ) -> SignalingResult<Value> {
        match tokio::time::timeout(self.request_timeout, &mut pending.reply).await {
            Ok(reply) => {
                let result = reply.unwrap_or_else(|_| Err(SignalingError::room_closed()));
                self.settle(pending.effect, &result);
                result
            }
            Err(_) => {
                warn!("Request from {} timed out after {:?}", self.label(), self.request_timeout);
                if let Some(correlation_id) = correlation_id {
                    if self.pending.len() >= RESPONSE_CACHE_SIZE {
                        self.pending.shift_remove_index(0);
                    }
                    self.pending.insert(correlation_id.clone(), pending);
                }
                Err(SignalingError::Timeout)
            }
        }
    }

    fn settle(&mut self, effect: Effect, result: &SignalingResult<Value>) {
        match effect {
            Effect::Join if result.is_err() => self.membership = None,
            Effect::Leave => self.membership = None,
            _ => {}
        }
    }

    /// Settles timed-out requests whose replies have since arrived.
    fn reap(&mut self) {
        let mut finished = Vec::new();
        for (correlation_id, pending) in self.pending.iter_mut() {
            let result = match pending.reply.try_recv() {
                Ok(result) => result,
                Err(TryRecvError::Empty) => continue,
                Err(TryRecvError::Closed) => Err(SignalingError::room_closed()),
            };
            finished.push((correlation_id.clone(), pending.effect, result));
        }
        for (correlation_id, effect, result) in finished {
            self.pending.shift_remove(&correlation_id);
            self.settle(effect, &result);
            let response = Response::from_result(correlation_id.clone(), &result);
            self.remember(correlation_id, response);
        }
    }

    fn remember(&mut self, correlation_id: CorrelationId, response: Response) {
        if self.answered.len() >= RESPONSE_CACHE_SIZE {
            self.answered.shift_remove_index(0);
        }
        self.answered.insert(correlation_id, response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{GuestAuthenticator, JwtAuthenticator};
    use crate::config::RoomPolicy;
    use crate::error::ErrorCode;
    use crate::media::mock::MockMediaEngine;
    use crate::room::roles::Role;
    use crate::room::Outbound;
    use serde_json::json;
    use tokio::sync::mpsc;

    const TIMEOUT: Duration = Duration::from_millis(500);

    struct Channel {
        session: Session,
        rx: mpsc::Receiver<Outbound>,
        next_id: u64,
    }

    impl Channel {
        fn open(registry: &RoomRegistry, authenticator: Arc<dyn Authenticator>) -> Self {
            let (tx, rx) = mpsc::channel(64);
            Self {
                session: Session::new(registry.clone(), authenticator, tx, TIMEOUT),
                rx,
                next_id: 0,
            }
        }

        async fn call_with(&mut self, id: u64, method: &str, data: Value) -> Response {
            let frame = json!({ "correlationId": id, "method": method, "data": data }).to_string();
            self.session.handle_text(&frame).await.unwrap()
        }

        async fn call(&mut self, method: &str, data: Value) -> Response {
            self.next_id += 1;
            self.call_with(self.next_id, method, data).await
        }

        async fn join(&mut self, room: &str, peer: &str) -> Response {
            self.call("join", json!({ "roomId": room, "peerId": peer, "displayName": peer }))
                .await
        }

        fn notifications(&mut self) -> Vec<Value> {
            let mut received = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                if let Outbound::Text(text) = frame {
                    received.push(serde_json::from_str(&text).unwrap());
                }
            }
            received
        }

        fn methods(&mut self) -> Vec<String> {
            self.notifications()
                .iter()
                .map(|n| n["method"].as_str().unwrap().to_string())
                .collect()
        }
    }

    fn registry(engine: Arc<MockMediaEngine>) -> RoomRegistry {
        RoomRegistry::new(engine, RoomPolicy::default(), None)
    }

    fn guest() -> Arc<dyn Authenticator> {
        Arc::new(GuestAuthenticator)
    }

    #[tokio::test]
    async fn test_requests_before_join_are_not_found() {
        let registry = registry(MockMediaEngine::new());
        let mut p1 = Channel::open(&registry, guest());

        let response = p1.call("raiseHand", json!({ "flag": true })).await;
        assert!(!response.ok);
        assert_eq!(response.error_code, Some(ErrorCode::NotFound));
        assert_eq!(response.correlation_id, CorrelationId::Number(1));
    }

    #[tokio::test]
    async fn test_scenario_lock_then_lobby_over_the_wire() {
        let registry = registry(MockMediaEngine::new());
        let mut p1 = Channel::open(&registry, guest());
        let mut p2 = Channel::open(&registry, guest());

        let joined = p1.join("abc", "p1").await;
        assert!(joined.ok);
        let snapshot = joined.data.unwrap();
        assert_eq!(snapshot["peers"], json!([]));
        assert_eq!(snapshot["locked"], false);

        assert!(p1.call("setRoomLock", json!({ "locked": true })).await.ok);

        let waiting = p2.join("abc", "p2").await;
        assert!(waiting.ok);
        assert_eq!(waiting.data.unwrap(), json!({ "status": "lobby" }));
        assert_eq!(p2.session.room_id(), Some("abc"));

        let added: Vec<_> = p1
            .notifications()
            .into_iter()
            .filter(|n| n["method"] == "lobbyPeerAdded")
            .collect();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0]["data"]["id"], "p2");
    }

    #[tokio::test]
    async fn test_second_join_on_one_channel_conflicts() {
        let registry = registry(MockMediaEngine::new());
        let mut p1 = Channel::open(&registry, guest());

        assert!(p1.join("abc", "p1").await.ok);
        let again = p1.join("other", "p1").await;
        assert_eq!(again.error_code, Some(ErrorCode::Conflict));
        assert!(registry.get("other").is_none());
    }

    #[tokio::test]
    async fn test_failed_join_leaves_the_channel_unjoined() {
        let registry = registry(MockMediaEngine::new());
        let mut p1 = Channel::open(&registry, guest());
        let mut imposter = Channel::open(&registry, guest());

        assert!(p1.join("abc", "p1").await.ok);
        let duplicate = imposter.join("abc", "p1").await;
        assert_eq!(duplicate.error_code, Some(ErrorCode::Conflict));
        assert_eq!(imposter.session.peer_id(), None);

        // The channel may retry with a free id.
        assert!(imposter.join("abc", "p2").await.ok);
    }

    #[tokio::test]
    async fn test_retried_correlation_id_is_not_reexecuted() {
        let registry = registry(MockMediaEngine::new());
        let mut p1 = Channel::open(&registry, guest());
        let mut p2 = Channel::open(&registry, guest());
        assert!(p1.join("abc", "p1").await.ok);
        assert!(p2.join("abc", "p2").await.ok);
        p2.notifications();

        let first = p1.call_with(77, "chatMessage", json!({ "text": "hello" })).await;
        let retry = p1.call_with(77, "chatMessage", json!({ "text": "hello" })).await;
        assert!(first.ok);
        assert!(retry.ok);

        let chats = p2.methods().into_iter().filter(|m| m == "chatMessage").count();
        assert_eq!(chats, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_keeps_the_mutation_and_retry_collects_it() {
        let engine = MockMediaEngine::new();
        let registry = registry(engine.clone());
        let mut p1 = Channel::open(&registry, guest());
        assert!(p1.join("abc", "p1").await.ok);

        engine.delay("create_webrtc_transport", TIMEOUT * 3 / 2);
        let timed_out = p1.call_with(5, "createTransport", json!({ "direction": "send" })).await;
        assert_eq!(timed_out.error_code, Some(ErrorCode::Timeout));

        let retried = p1.call_with(5, "createTransport", json!({ "direction": "send" })).await;
        assert!(retried.ok, "{retried:?}");
        let created = engine
            .calls()
            .iter()
            .filter(|c| c.starts_with("create_webrtc_transport"))
            .count();
        assert_eq!(created, 1);

        // A second send transport is a conflict: the timed-out request did run.
        let again = p1.call("createTransport", json!({ "direction": "send" })).await;
        assert_eq!(again.error_code, Some(ErrorCode::Conflict));
    }

    #[tokio::test]
    async fn test_notifications_execute_without_a_response() {
        let registry = registry(MockMediaEngine::new());
        let mut p1 = Channel::open(&registry, guest());
        let mut p2 = Channel::open(&registry, guest());
        assert!(p1.join("abc", "p1").await.ok);
        assert!(p2.join("abc", "p2").await.ok);
        p2.notifications();

        let frame = json!({ "method": "raiseHand", "data": { "flag": true } }).to_string();
        assert!(p1.session.handle_text(&frame).await.is_none());

        // The next request queues behind the notification.
        assert!(p1.call("getRouterRtpCapabilities", json!({})).await.ok);
        assert_eq!(p2.methods(), vec!["raisedHand"]);
    }

    #[tokio::test]
    async fn test_bad_frames() {
        let registry = registry(MockMediaEngine::new());
        let mut p1 = Channel::open(&registry, guest());

        assert!(p1.session.handle_text("{{{").await.is_none());
        let response = p1
            .session
            .handle_text(r#"{"correlationId":"x","method":"join","data":{"roomId":"abc"}}"#)
            .await
            .unwrap();
        assert_eq!(response.error_code, Some(ErrorCode::Validation));
        assert_eq!(response.correlation_id, CorrelationId::Text("x".into()));
    }

    #[tokio::test]
    async fn test_every_request_id_gets_an_answer() {
        let registry = registry(MockMediaEngine::new());
        let mut p1 = Channel::open(&registry, guest());

        let no_method = p1.session.handle_text(r#"{"correlationId":1}"#).await.unwrap();
        assert_eq!(no_method.correlation_id, CorrelationId::Number(1));
        assert_eq!(no_method.error_code, Some(ErrorCode::Validation));

        let bad_method = p1
            .session
            .handle_text(r#"{"correlationId":2,"method":5,"data":{}}"#)
            .await
            .unwrap();
        assert_eq!(bad_method.correlation_id, CorrelationId::Number(2));
        assert_eq!(bad_method.error_code, Some(ErrorCode::Validation));

        // Unusual but well-formed ids are requests like any other.
        let negative = p1
            .session
            .handle_text(r#"{"correlationId":-3,"method":"leave"}"#)
            .await
            .unwrap();
        assert_eq!(serde_json::to_value(&negative).unwrap()["correlationId"], json!(-3));
        assert_eq!(negative.error_code, Some(ErrorCode::NotFound));

        let fractional = p1
            .session
            .handle_text(r#"{"correlationId":4.5,"method":"leave"}"#)
            .await
            .unwrap();
        assert_eq!(serde_json::to_value(&fractional).unwrap()["correlationId"], json!(4.5));

        let odd_id = p1
            .session
            .handle_text(r#"{"correlationId":{"n":6},"method":"leave"}"#)
            .await
            .unwrap();
        assert_eq!(odd_id.error_code, Some(ErrorCode::Validation));
        assert_eq!(odd_id.correlation_id, CorrelationId::Text(r#"{"n":6}"#.into()));

        assert!(p1.session.handle_text(r#"{"method":5}"#).await.is_none());
    }

    #[tokio::test]
    async fn test_token_roles_bypass_the_lobby() {
        let auth = Arc::new(JwtAuthenticator::new("a-long-enough-test-secret-for-hs256"));
        let registry = registry(MockMediaEngine::new());
        let mut p1 = Channel::open(&registry, auth.clone());
        let mut admin = Channel::open(&registry, auth.clone());
        let mut forger = Channel::open(&registry, auth.clone());

        assert!(p1.join("abc", "p1").await.ok);
        assert!(p1.call("setRoomLock", json!({ "locked": true })).await.ok);

        let token = auth.create_token("u-1", Some("Boss"), &[Role::Admin]).unwrap();
        let joined = admin
            .call("join", json!({ "roomId": "abc", "peerId": "boss", "token": token }))
            .await;
        let snapshot = joined.data.unwrap();
        assert_eq!(snapshot["status"], "joined");
        assert!(snapshot["roles"].as_array().unwrap().contains(&json!("admin")));

        let rejected = forger
            .call("join", json!({ "roomId": "abc", "peerId": "x", "token": "bogus" }))
            .await;
        assert_eq!(rejected.error_code, Some(ErrorCode::PermissionDenied));
    }

    #[tokio::test]
    async fn test_close_runs_the_leave_cascade() {
        let registry = registry(MockMediaEngine::new());
        let mut p1 = Channel::open(&registry, guest());
        let mut p2 = Channel::open(&registry, guest());
        assert!(p1.join("abc", "p1").await.ok);
        assert!(p2.join("abc", "p2").await.ok);
        p2.notifications();

        p1.session.close();
        // Requests queue behind the disconnect.
        assert!(p2.call("raiseHand", json!({ "flag": false })).await.ok);
        assert!(p2.methods().contains(&"peerClosed".to_string()));
        assert_eq!(registry.summary("abc").unwrap().peers.len(), 1);
    }

    #[tokio::test]
    async fn test_leave_then_rejoin() {
        let registry = registry(MockMediaEngine::new());
        let mut p1 = Channel::open(&registry, guest());
        let mut p2 = Channel::open(&registry, guest());
        assert!(p1.join("abc", "p1").await.ok);
        assert!(p2.join("abc", "p2").await.ok);

        assert!(p1.call("leave", json!({})).await.ok);
        assert_eq!(p1.session.peer_id(), None);
        assert!(p1.join("abc", "p1").await.ok);
    }
}
