//! Role-based access control for staff profiles.
//!
//! Roles form a strict authority order (admin > general_manager > team_leader >
//! agent). Route handlers ask `Role::can` for a permission; profile management
//! additionally asks `Role::can_assign` so nobody can grant more authority than
//! they hold.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    GeneralManager,
    TeamLeader,
    Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ManageOrganization,
    ManageUsers,
    ManageTeams,
    ViewContacts,
    ManageContacts,
    ManageTemplates,
    ViewCampaigns,
    ManageCampaigns,
    ViewAnalytics,
    ReplyConversations,
    AssignConversations,
    CloseConversations,
}

const ALL_PERMISSIONS: &[Permission] = &[
    Permission::ManageOrganization,
    Permission::ManageUsers,
    Permission::ManageTeams,
    Permission::ViewContacts,
    Permission::ManageContacts,
    Permission::ManageTemplates,
    Permission::ViewCampaigns,
    Permission::ManageCampaigns,
    Permission::ViewAnalytics,
    Permission::ReplyConversations,
    Permission::AssignConversations,
    Permission::CloseConversations,
];

const GENERAL_MANAGER_PERMISSIONS: &[Permission] = &[
    Permission::ManageUsers,
    Permission::ManageTeams,
    Permission::ViewContacts,
    Permission::ManageContacts,
    Permission::ManageTemplates,
    Permission::ViewCampaigns,
    Permission::ManageCampaigns,
    Permission::ViewAnalytics,
    Permission::ReplyConversations,
    Permission::AssignConversations,
    Permission::CloseConversations,
];

const TEAM_LEADER_PERMISSIONS: &[Permission] = &[
    Permission::ViewContacts,
    Permission::ManageContacts,
    Permission::ViewCampaigns,
    Permission::ViewAnalytics,
    Permission::ReplyConversations,
    Permission::AssignConversations,
    Permission::CloseConversations,
];

const AGENT_PERMISSIONS: &[Permission] = &[
    Permission::ViewContacts,
    Permission::ReplyConversations,
    Permission::CloseConversations,
];

impl Role {
    pub fn parse(raw: &str) -> Result<Role, CoreError> {
        match raw.trim().to_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "general_manager" => Ok(Role::GeneralManager),
            "team_leader" => Ok(Role::TeamLeader),
            "agent" => Ok(Role::Agent),
            other => Err(CoreError::invalid(
                "role",
                format!(
                    "unknown role '{other}', expected admin, general_manager, team_leader or agent"
                ),
            )),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::GeneralManager => "general_manager",
            Role::TeamLeader => "team_leader",
            Role::Agent => "agent",
        }
    }

    fn rank(self) -> u8 {
        match self {
            Role::Admin => 3,
            Role::GeneralManager => 2,
            Role::TeamLeader => 1,
            Role::Agent => 0,
        }
    }

    pub fn permissions(self) -> &'static [Permission] {
        match self {
            Role::Admin => ALL_PERMISSIONS,
            Role::GeneralManager => GENERAL_MANAGER_PERMISSIONS,
            Role::TeamLeader => TEAM_LEADER_PERMISSIONS,
            Role::Agent => AGENT_PERMISSIONS,
        }
    }

    pub fn can(self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }

    /// Whether a profile with this role may give `target` to someone.
    pub fn can_assign(self, target: Role) -> bool {
        if !self.can(Permission::ManageUsers) {
            return false;
        }
        self == Role::Admin || target.rank() < self.rank()
    }

    /// Whether this role outranks `other` (used to protect profiles from
    /// edits by peers or subordinates).
    pub fn outranks(self, other: Role) -> bool {
        self == Role::Admin || self.rank() > other.rank()
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Permission::ManageOrganization => "manage_organization",
            Permission::ManageUsers => "manage_users",
            Permission::ManageTeams => "manage_teams",
            Permission::ViewContacts => "view_contacts",
            Permission::ManageContacts => "manage_contacts",
            Permission::ManageTemplates => "manage_templates",
            Permission::ViewCampaigns => "view_campaigns",
            Permission::ManageCampaigns => "manage_campaigns",
            Permission::ViewAnalytics => "view_analytics",
            Permission::ReplyConversations => "reply_conversations",
            Permission::AssignConversations => "assign_conversations",
            Permission::CloseConversations => "close_conversations",
        }
    }
}

/// Which conversations a profile may see and act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationScope {
    All,
    Team(Uuid),
    Own(Uuid),
}

pub fn conversation_scope(role: Role, profile_id: Uuid, team_id: Option<Uuid>) -> ConversationScope {
    match role {
        Role::Admin | Role::GeneralManager => ConversationScope::All,
        Role::TeamLeader => match team_id {
            Some(team_id) => ConversationScope::Team(team_id),
            None => ConversationScope::Own(profile_id),
        },
        Role::Agent => ConversationScope::Own(profile_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_insensitive_and_rejects_unknown() {
        assert_eq!(Role::parse(" Team_Leader ").unwrap(), Role::TeamLeader);
        assert_eq!(Role::parse("ADMIN").unwrap(), Role::Admin);
        assert!(Role::parse("owner").is_err());
    }

    #[test]
    fn role_serializes_as_snake_case() {
        assert_eq!(
            serde_json::to_value(Role::GeneralManager).unwrap(),
            serde_json::json!("general_manager")
        );
        assert_eq!(Role::GeneralManager.to_string(), "general_manager");
    }

    #[test]
    fn admin_holds_every_permission() {
        for permission in ALL_PERMISSIONS {
            assert!(Role::Admin.can(*permission), "{}", permission.as_str());
        }
    }

    #[test]
    fn general_manager_cannot_manage_organization() {
        assert!(!Role::GeneralManager.can(Permission::ManageOrganization));
        assert!(Role::GeneralManager.can(Permission::ManageCampaigns));
    }

    #[test]
    fn agent_cannot_touch_campaigns_or_users() {
        assert!(!Role::Agent.can(Permission::ViewCampaigns));
        assert!(!Role::Agent.can(Permission::ManageUsers));
        assert!(!Role::Agent.can(Permission::AssignConversations));
        assert!(Role::Agent.can(Permission::ReplyConversations));
    }

    #[test]
    fn permissions_shrink_with_rank() {
        let ordered = [Role::Admin, Role::GeneralManager, Role::TeamLeader, Role::Agent];
        for pair in ordered.windows(2) {
            for permission in pair[1].permissions() {
                assert!(
                    pair[0].can(*permission),
                    "{} lacks {} held by {}",
                    pair[0],
                    permission.as_str(),
                    pair[1]
                );
            }
        }
    }

    #[test]
    fn assignment_never_exceeds_own_rank() {
        assert!(Role::Admin.can_assign(Role::Admin));
        assert!(Role::GeneralManager.can_assign(Role::TeamLeader));
        assert!(Role::GeneralManager.can_assign(Role::Agent));
        assert!(!Role::GeneralManager.can_assign(Role::GeneralManager));
        assert!(!Role::GeneralManager.can_assign(Role::Admin));
        assert!(!Role::TeamLeader.can_assign(Role::Agent));
        assert!(!Role::Agent.can_assign(Role::Agent));
    }

    #[test]
    fn scope_follows_role() {
        let me = Uuid::now_v7();
        let team = Uuid::now_v7();
        assert_eq!(conversation_scope(Role::Admin, me, None), ConversationScope::All);
        assert_eq!(
            conversation_scope(Role::GeneralManager, me, Some(team)),
            ConversationScope::All
        );
        assert_eq!(
            conversation_scope(Role::TeamLeader, me, Some(team)),
            ConversationScope::Team(team)
        );
        assert_eq!(
            conversation_scope(Role::TeamLeader, me, None),
            ConversationScope::Own(me)
        );
        assert_eq!(
            conversation_scope(Role::Agent, me, Some(team)),
            ConversationScope::Own(me)
        );
    }
}
