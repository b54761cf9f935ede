#![forbid(unsafe_code)]

// Signaling protocol - Message types for WebSocket communication
//
// Inbound:  { correlationId?, method, data }
// Response: { correlationId, ok: true, data } | { correlationId, ok: false, errorCode, message }
// Outbound notification: { method, data }

use crate::error::{ErrorCode, SignalingError};
use crate::media::{MediaKind, TransportDirection, TransportParams};
use crate::room::peer::ProducerSource;
use crate::room::roles::Role;
use crate::turn::IceServer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Caller supplied request id, echoed back in the response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CorrelationId {
    Number(u64),
    Text(String),
    /// Negative or fractional ids are echoed verbatim.
    OtherNumber(serde_json::Number),
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationId::Number(n) => write!(f, "{n}"),
            CorrelationId::Text(s) => f.write_str(s),
            CorrelationId::OtherNumber(n) => write!(f, "{n}"),
        }
    }
}

/// Decoded inbound frame. A frame without a correlation id is a
/// fire-and-forget notification.
#[derive(Debug)]
pub struct Inbound {
    pub correlation_id: Option<CorrelationId>,
    pub method: String,
    pub request: Result<ClientRequest, SignalingError>,
}

/// A frame whose envelope could not be decoded. The correlation id is
/// kept when one was present so the sender still gets an answer.
#[derive(Debug)]
pub struct Rejected {
    pub correlation_id: Option<CorrelationId>,
    pub error: SignalingError,
}

impl Inbound {
    /// Parses one text frame.
    ///
    /// # Errors
    /// Fails when the frame is not a JSON object, its `correlationId` is
    /// neither a string nor a number, or `method` is missing or not a
    /// string. A bad payload for a known envelope is reported through
    /// `request` instead.
    pub fn parse(text: &str) -> Result<Self, Rejected> {
        let mut frame = match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(frame)) => frame,
            Ok(_) => return Err(Rejected::new(None, "frame must be a JSON object")),
            Err(e) => {
                return Err(Rejected {
                    correlation_id: None,
                    error: e.into(),
                })
            }
        };

        let correlation_id = match frame.remove("correlationId") {
            None | Some(Value::Null) => None,
            Some(raw) => match serde_json::from_value(raw.clone()) {
                Ok(id) => Some(id),
                Err(_) => {
                    let echoed = CorrelationId::Text(raw.to_string());
                    return Err(Rejected::new(
                        Some(echoed),
                        "correlationId must be a string or a number",
                    ));
                }
            },
        };
        let method = match frame.remove("method") {
            Some(Value::String(method)) => method,
            Some(_) => return Err(Rejected::new(correlation_id, "method must be a string")),
            None => return Err(Rejected::new(correlation_id, "missing method")),
        };
        let data = match frame.remove("data") {
            None | Some(Value::Null) => Value::Object(Default::default()),
            Some(data) => data,
        };

        let request = serde_json::from_value::<ClientRequest>(serde_json::json!({
            "method": method,
            "data": data,
        }))
        .map_err(SignalingError::from);

        Ok(Self { correlation_id, method, request })
    }
}

impl Rejected {
    fn new(correlation_id: Option<CorrelationId>, reason: &str) -> Self {
        Self {
            correlation_id,
            error: SignalingError::Validation(reason.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleOp {
    Add,
    Remove,
}

/// Client-to-server requests, keyed by `method`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "method", content = "data", rename_all = "camelCase")]
pub enum ClientRequest {
    #[serde(rename_all = "camelCase")]
    Join {
        room_id: String,
        peer_id: String,
        #[serde(default)]
        display_name: Option<String>,
        #[serde(default)]
        picture: Option<String>,
        #[serde(default)]
        rtp_capabilities: Option<Value>,
        #[serde(default)]
        token: Option<String>,
    },
    Leave {},
    GetRouterRtpCapabilities {},
    #[serde(rename_all = "camelCase")]
    CreateTransport {
        direction: TransportDirection,
    },
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: String,
        dtls_parameters: Value,
    },
    #[serde(rename_all = "camelCase")]
    RestartIce {
        transport_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: Value,
        #[serde(default)]
        source: Option<ProducerSource>,
        #[serde(default)]
        paused: bool,
    },
    #[serde(rename_all = "camelCase")]
    Consume {
        producer_id: String,
        #[serde(default)]
        rtp_capabilities: Option<Value>,
        #[serde(default)]
        transport_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    CloseProducer {
        producer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    PauseProducer {
        producer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ResumeProducer {
        producer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    PauseConsumer {
        consumer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ResumeConsumer {
        consumer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    SetConsumerPreferredLayers {
        consumer_id: String,
        spatial_layer: u8,
        #[serde(default)]
        temporal_layer: Option<u8>,
    },
    #[serde(rename_all = "camelCase")]
    GetTransportStats {
        transport_id: String,
    },
    #[serde(rename_all = "camelCase")]
    GetProducerStats {
        producer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    GetConsumerStats {
        consumer_id: String,
    },
    SetRoomLock {
        locked: bool,
    },
    #[serde(rename_all = "camelCase")]
    PromotePeer {
        peer_id: String,
    },
    PromoteAllPeers {},
    #[serde(rename_all = "camelCase")]
    ChangeRole {
        peer_id: String,
        role: Role,
        op: RoleOp,
    },
    #[serde(rename_all = "camelCase")]
    KickPeer {
        peer_id: String,
    },
    RaiseHand {
        flag: bool,
    },
    #[serde(rename_all = "camelCase")]
    LowerHand {
        peer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ChangeDisplayName {
        display_name: String,
    },
    ChangePicture {
        picture: String,
    },
    ChatMessage {
        text: String,
    },
    ClearChat {},
    #[serde(rename_all = "camelCase")]
    SendFile {
        magnet_uri: String,
    },
    ClearFileSharing {},
    #[serde(rename_all = "camelCase")]
    Mute {
        peer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    StopVideo {
        peer_id: String,
    },
    #[serde(rename_all = "camelCase")]
    StopScreenSharing {
        peer_id: String,
    },
    MuteAll {},
    StopAllVideo {},
    StopAllScreenSharing {},
    CloseMeeting {},
}

/// Reply to a request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub correlation_id: CorrelationId,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Response {
    pub fn success(correlation_id: CorrelationId, data: Value) -> Self {
        Self {
            correlation_id,
            ok: true,
            data: Some(data),
            error_code: None,
            message: None,
        }
    }

    pub fn failure(correlation_id: CorrelationId, error: &SignalingError) -> Self {
        Self {
            correlation_id,
            ok: false,
            data: None,
            error_code: Some(error.code()),
            message: Some(error.client_message()),
        }
    }

    pub fn from_result(correlation_id: CorrelationId, result: &Result<Value, SignalingError>) -> Self {
        match result {
            Ok(data) => Self::success(correlation_id, data.clone()),
            Err(e) => Self::failure(correlation_id, e),
        }
    }
}

/// Peer as seen by other peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    pub roles: Vec<Role>,
    pub raised_hand: bool,
    pub producers: Vec<ProducerInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub id: String,
    pub kind: MediaKind,
    pub source: ProducerSource,
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyPeerInfo {
    pub id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    pub peer_id: String,
    pub display_name: String,
    pub text: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub peer_id: String,
    pub display_name: String,
    pub magnet_uri: String,
    pub timestamp: u64,
}

/// Full room view handed to a peer when it is admitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room_id: String,
    pub peer_id: String,
    pub roles: Vec<Role>,
    pub peers: Vec<PeerInfo>,
    pub locked: bool,
    pub spotlights: Vec<String>,
    pub active_speaker_id: Option<String>,
    pub lobby_peers: Vec<LobbyPeerInfo>,
    pub chat_history: Vec<ChatEntry>,
    pub file_history: Vec<FileEntry>,
    pub router_rtp_capabilities: Value,
}

/// Result of a `join` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum JoinOutcome {
    Joined(RoomSnapshot),
    Lobby {},
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportCreated {
    #[serde(flatten)]
    pub params: TransportParams,
    pub direction: TransportDirection,
    pub ice_servers: Vec<IceServer>,
}

/// Server-to-client notifications, keyed by `method`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "method", content = "data", rename_all = "camelCase")]
pub enum Notification {
    NewPeer(PeerInfo),
    #[serde(rename_all = "camelCase")]
    PeerClosed { peer_id: String },
    #[serde(rename_all = "camelCase")]
    NewProducer {
        peer_id: String,
        producer_id: String,
        kind: MediaKind,
        source: ProducerSource,
        paused: bool,
    },
    #[serde(rename_all = "camelCase")]
    ProducerClosed { peer_id: String, producer_id: String },
    #[serde(rename_all = "camelCase")]
    ProducerPaused { peer_id: String, producer_id: String },
    #[serde(rename_all = "camelCase")]
    ProducerResumed { peer_id: String, producer_id: String },
    #[serde(rename_all = "camelCase")]
    ConsumerClosed { consumer_id: String, producer_id: String },
    #[serde(rename_all = "camelCase")]
    ConsumerPaused { consumer_id: String },
    #[serde(rename_all = "camelCase")]
    ConsumerResumed { consumer_id: String },
    #[serde(rename_all = "camelCase")]
    ConsumerLayersChanged {
        consumer_id: String,
        spatial_layer: Option<u8>,
        temporal_layer: Option<u8>,
    },
    #[serde(rename_all = "camelCase")]
    ActiveSpeaker { peer_id: Option<String> },
    #[serde(rename_all = "camelCase")]
    SpotlightsChanged { peer_ids: Vec<String> },
    #[serde(rename_all = "camelCase")]
    RoomLocked { peer_id: String },
    #[serde(rename_all = "camelCase")]
    RoomUnlocked { peer_id: String },
    LobbyPeerAdded(LobbyPeerInfo),
    #[serde(rename_all = "camelCase")]
    LobbyPeerClosed { peer_id: String },
    #[serde(rename_all = "camelCase")]
    LobbyPeerPromoted { peer_id: String, promoted_by: Option<String> },
    #[serde(rename_all = "camelCase")]
    LobbyPeerDisplayNameChanged { peer_id: String, display_name: String },
    #[serde(rename_all = "camelCase")]
    LobbyPeerPictureChanged { peer_id: String, picture: String },
    RoomReady(RoomSnapshot),
    #[serde(rename_all = "camelCase")]
    RoleChanged { peer_id: String, role: Role, op: RoleOp },
    #[serde(rename_all = "camelCase")]
    DisplayNameChanged {
        peer_id: String,
        display_name: String,
        old_display_name: String,
    },
    #[serde(rename_all = "camelCase")]
    PictureChanged { peer_id: String, picture: String },
    #[serde(rename_all = "camelCase")]
    RaisedHand { peer_id: String, raised_hand: bool },
    ChatMessage(ChatEntry),
    #[serde(rename_all = "camelCase")]
    ChatCleared { peer_id: String },
    SendFile(FileEntry),
    #[serde(rename_all = "camelCase")]
    FilesCleared { peer_id: String },
    Kicked {},
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_request_with_numeric_correlation_id() {
        let inbound = Inbound::parse(
            r#"{"correlationId":7,"method":"setRoomLock","data":{"locked":true}}"#,
        )
        .unwrap();
        assert_eq!(inbound.correlation_id, Some(CorrelationId::Number(7)));
        assert!(matches!(inbound.request, Ok(ClientRequest::SetRoomLock { locked: true })));
    }

    #[test]
    fn test_missing_data_is_empty_object() {
        let inbound = Inbound::parse(r#"{"correlationId":"a1","method":"leave"}"#).unwrap();
        assert_eq!(inbound.correlation_id, Some(CorrelationId::Text("a1".into())));
        assert!(matches!(inbound.request, Ok(ClientRequest::Leave {})));

        let inbound = Inbound::parse(r#"{"method":"promoteAllPeers","data":null}"#).unwrap();
        assert!(inbound.correlation_id.is_none());
        assert!(matches!(inbound.request, Ok(ClientRequest::PromoteAllPeers {})));
    }

    #[test]
    fn test_bad_payload_keeps_envelope() {
        let inbound = Inbound::parse(r#"{"correlationId":1,"method":"kickPeer","data":{}}"#).unwrap();
        assert_eq!(inbound.method, "kickPeer");
        assert!(matches!(inbound.request, Err(SignalingError::Validation(_))));

        let inbound = Inbound::parse(r#"{"correlationId":2,"method":"teleport"}"#).unwrap();
        assert!(matches!(inbound.request, Err(SignalingError::Validation(_))));
    }

    #[test]
    fn test_unparseable_frames() {
        let rejected = Inbound::parse("not json").unwrap_err();
        assert!(rejected.correlation_id.is_none());
        assert!(Inbound::parse("[1, 2]").unwrap_err().correlation_id.is_none());

        let rejected = Inbound::parse(r#"{"correlationId":1}"#).unwrap_err();
        assert_eq!(rejected.correlation_id, Some(CorrelationId::Number(1)));
        assert!(matches!(rejected.error, SignalingError::Validation(_)));

        let rejected = Inbound::parse(r#"{"correlationId":2,"method":5}"#).unwrap_err();
        assert_eq!(rejected.correlation_id, Some(CorrelationId::Number(2)));

        let rejected = Inbound::parse(r#"{"correlationId":[9],"method":"leave"}"#).unwrap_err();
        assert_eq!(rejected.correlation_id, Some(CorrelationId::Text("[9]".into())));
    }

    #[test]
    fn test_negative_and_fractional_ids_are_echoed() {
        let inbound = Inbound::parse(r#"{"correlationId":-3,"method":"leave"}"#).unwrap();
        let id = inbound.correlation_id.unwrap();
        let response = Response::success(id, json!({}));
        assert_eq!(serde_json::to_value(&response).unwrap()["correlationId"], json!(-3));

        let inbound = Inbound::parse(r#"{"correlationId":4.5,"method":"leave"}"#).unwrap();
        let id = inbound.correlation_id.unwrap();
        assert_eq!(id.to_string(), "4.5");
        let response = Response::success(id, json!({}));
        assert_eq!(serde_json::to_value(&response).unwrap()["correlationId"], json!(4.5));
    }

    #[test]
    fn test_change_role_payload() {
        let inbound = Inbound::parse(
            r#"{"correlationId":3,"method":"changeRole","data":{"peerId":"p2","role":"moderator","op":"add"}}"#,
        )
        .unwrap();
        match inbound.request.unwrap() {
            ClientRequest::ChangeRole { peer_id, role, op } => {
                assert_eq!(peer_id, "p2");
                assert_eq!(role, Role::Moderator);
                assert_eq!(op, RoleOp::Add);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_error_response_shape() {
        let response = Response::failure(
            CorrelationId::Number(9),
            &SignalingError::PermissionDenied("not allowed".into()),
        );
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({
                "correlationId": 9,
                "ok": false,
                "errorCode": "PermissionDenied",
                "message": "not allowed",
            })
        );
    }

    #[test]
    fn test_notification_shape() {
        let value = serde_json::to_value(Notification::ConsumerClosed {
            consumer_id: "c1".into(),
            producer_id: "p1".into(),
        })
        .unwrap();
        assert_eq!(
            value,
            json!({ "method": "consumerClosed", "data": { "consumerId": "c1", "producerId": "p1" } })
        );

        let value = serde_json::to_value(Notification::Kicked {}).unwrap();
        assert_eq!(value, json!({ "method": "kicked", "data": {} }));
    }

    #[test]
    fn test_lobby_join_outcome_shape() {
        let value = serde_json::to_value(JoinOutcome::Lobby {}).unwrap();
        assert_eq!(value, json!({ "status": "lobby" }));
    }
}
