#![forbid(unsafe_code)]

// Permission engine - role based access and action checks

use super::roles::{Access, Permission, Role};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

pub type RoleSet = BTreeSet<Role>;

/// Role configuration evaluated by the permission engine.
///
/// Loaded once at startup and shared by every room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleConfig {
    #[serde(default)]
    pub access_from_roles: HashMap<Access, Vec<Role>>,
    #[serde(default)]
    pub permissions_from_roles: HashMap<Permission, Vec<Role>>,
    #[serde(default)]
    pub allow_when_role_missing: Vec<Permission>,
}

impl Default for RoleConfig {
    fn default() -> Self {
        use Permission::*;

        let staff = vec![Role::Moderator, Role::Admin];
        let everyone = vec![Role::Normal];

        let permissions_from_roles = HashMap::from([
            (ChangeRoomLock, staff.clone()),
            (PromotePeer, staff.clone()),
            (ModerateChat, staff.clone()),
            (ModerateFiles, staff.clone()),
            (ModerateRoom, staff),
            (ModifyRole, vec![Role::Admin]),
            (SendChat, everyone.clone()),
            (ShareAudio, everyone.clone()),
            (ShareVideo, everyone.clone()),
            (ShareScreen, everyone.clone()),
            (ExtraVideo, everyone.clone()),
            (ShareFile, everyone),
        ]);

        let access_from_roles = HashMap::from([
            (Access::BypassRoomLock, vec![Role::Admin]),
            (Access::BypassLobby, vec![Role::Admin, Role::Moderator]),
        ]);

        Self {
            access_from_roles,
            permissions_from_roles,
            allow_when_role_missing: vec![ChangeRoomLock, PromotePeer],
        }
    }
}

impl RoleConfig {
    /// Reads a JSON role configuration from disk.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading role config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing role config {}", path.display()))
    }

    fn roles_for(&self, action: Permission) -> &[Role] {
        self.permissions_from_roles
            .get(&action)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether a peer holding `roles` may perform `action` in a room whose
    /// joined peers hold `present`.
    ///
    /// Actions listed in `allow_when_role_missing` are open to everyone while
    /// no joined peer holds an authorized role.
    pub fn has_permission<'a, I>(&self, roles: &RoleSet, present: I, action: Permission) -> bool
    where
        I: IntoIterator<Item = &'a RoleSet>,
    {
        let authorized = self.roles_for(action);
        if roles.iter().any(|role| authorized.contains(role)) {
            return true;
        }

        if !self.allow_when_role_missing.contains(&action) {
            return false;
        }

        let holder_present = present
            .into_iter()
            .any(|set| set.iter().any(|role| authorized.contains(role)));
        !holder_present
    }

    /// Admission bypass checks have no fallback.
    pub fn has_access(&self, roles: &RoleSet, access: Access) -> bool {
        self.access_from_roles
            .get(&access)
            .is_some_and(|authorized| roles.iter().any(|role| authorized.contains(role)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(roles: &[Role]) -> RoleSet {
        roles.iter().copied().collect()
    }

    #[test]
    fn test_lock_allowed_while_no_moderator_present() {
        let config = RoleConfig::default();
        let normal = set(&[Role::Normal]);
        let present = vec![normal.clone(), set(&[Role::Normal, Role::Authenticated])];

        assert!(config.has_permission(&normal, &present, Permission::ChangeRoomLock));
    }

    #[test]
    fn test_lock_fallback_revoked_once_moderator_joins() {
        let config = RoleConfig::default();
        let normal = set(&[Role::Normal]);
        let moderator = set(&[Role::Normal, Role::Moderator]);
        let present = vec![normal.clone(), moderator.clone()];

        assert!(!config.has_permission(&normal, &present, Permission::ChangeRoomLock));
        assert!(config.has_permission(&moderator, &present, Permission::ChangeRoomLock));
    }

    #[test]
    fn test_fallback_only_applies_to_listed_actions() {
        let config = RoleConfig::default();
        let normal = set(&[Role::Normal]);
        let present = vec![normal.clone()];

        assert!(config.has_permission(&normal, &present, Permission::PromotePeer));
        assert!(!config.has_permission(&normal, &present, Permission::ModerateRoom));
        assert!(!config.has_permission(&normal, &present, Permission::ModifyRole));
        assert!(config.has_permission(&normal, &present, Permission::ShareAudio));
    }

    #[test]
    fn test_access_is_strictly_role_gated() {
        let config = RoleConfig::default();
        assert!(!config.has_access(&set(&[Role::Normal]), Access::BypassLobby));
        assert!(config.has_access(&set(&[Role::Normal, Role::Moderator]), Access::BypassLobby));
        assert!(!config.has_access(&set(&[Role::Moderator]), Access::BypassRoomLock));
        assert!(config.has_access(&set(&[Role::Admin]), Access::BypassRoomLock));
    }

    #[test]
    fn test_parse_role_config_json() {
        let raw = r#"{
            "accessFromRoles": { "BYPASS_LOBBY": ["presenter"] },
            "permissionsFromRoles": { "SHARE_SCREEN": ["presenter"] },
            "allowWhenRoleMissing": ["SHARE_SCREEN"]
        }"#;
        let config: RoleConfig = serde_json::from_str(raw).unwrap();
        let normal = set(&[Role::Normal]);

        assert!(config.has_access(&set(&[Role::Presenter]), Access::BypassLobby));
        assert!(config.has_permission(&normal, [&normal], Permission::ShareScreen));
        assert!(!config.has_permission(&normal, [&set(&[Role::Presenter])], Permission::ShareScreen));
    }
}
