#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Normal,
    Authenticated,
    Presenter,
    Moderator,
    Admin,
}

impl Role {
    /// Every peer holds this role for as long as it is in a room.
    pub const DEFAULT: Role = Role::Normal;

    pub fn level(self) -> u8 {
        match self {
            Role::Normal => 10,
            Role::Authenticated => 20,
            Role::Presenter => 30,
            Role::Moderator => 40,
            Role::Admin => 50,
        }
    }

    /// Whether the role may be granted or revoked through `changeRole`.
    pub fn promotable(self) -> bool {
        !matches!(self, Role::Normal | Role::Admin)
    }

    pub fn name(self) -> &'static str {
        match self {
            Role::Normal => "normal",
            Role::Authenticated => "authenticated",
            Role::Presenter => "presenter",
            Role::Moderator => "moderator",
            Role::Admin => "admin",
        }
    }

    /// Parses a role claim as issued by the identity provider.
    pub fn from_claim(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "normal" => Some(Role::Normal),
            "authenticated" => Some(Role::Authenticated),
            "presenter" => Some(Role::Presenter),
            "moderator" => Some(Role::Moderator),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// Actions gated by `permissionsFromRoles`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    ChangeRoomLock,
    PromotePeer,
    ModifyRole,
    SendChat,
    ModerateChat,
    ShareAudio,
    ShareVideo,
    ShareScreen,
    ExtraVideo,
    ShareFile,
    ModerateFiles,
    ModerateRoom,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Permission::ChangeRoomLock => "CHANGE_ROOM_LOCK",
            Permission::PromotePeer => "PROMOTE_PEER",
            Permission::ModifyRole => "MODIFY_ROLE",
            Permission::SendChat => "SEND_CHAT",
            Permission::ModerateChat => "MODERATE_CHAT",
            Permission::ShareAudio => "SHARE_AUDIO",
            Permission::ShareVideo => "SHARE_VIDEO",
            Permission::ShareScreen => "SHARE_SCREEN",
            Permission::ExtraVideo => "EXTRA_VIDEO",
            Permission::ShareFile => "SHARE_FILE",
            Permission::ModerateFiles => "MODERATE_FILES",
            Permission::ModerateRoom => "MODERATE_ROOM",
        }
    }
}

/// Admission bypasses gated by `accessFromRoles`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Access {
    BypassRoomLock,
    BypassLobby,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_ordering() {
        assert!(Role::Admin.level() > Role::Moderator.level());
        assert!(Role::Moderator.level() > Role::Presenter.level());
        assert!(Role::Presenter.level() > Role::Authenticated.level());
        assert!(Role::Authenticated.level() > Role::Normal.level());
    }

    #[test]
    fn test_promotable() {
        assert!(Role::Moderator.promotable());
        assert!(Role::Presenter.promotable());
        assert!(!Role::Normal.promotable());
        assert!(!Role::Admin.promotable());
    }

    #[test]
    fn test_from_claim() {
        assert_eq!(Role::from_claim("Moderator"), Some(Role::Moderator));
        assert_eq!(Role::from_claim("owner"), None);
    }

    #[test]
    fn test_permission_wire_names() {
        assert_eq!(serde_json::to_value(Permission::ChangeRoomLock).unwrap(), "CHANGE_ROOM_LOCK");
        assert_eq!(serde_json::to_value(Access::BypassLobby).unwrap(), "BYPASS_LOBBY");
        assert_eq!(
            serde_json::to_value(Permission::ModerateFiles).unwrap(),
            Permission::ModerateFiles.as_str()
        );
        assert_eq!(serde_json::to_value(Role::Presenter).unwrap(), "presenter");
    }
}
