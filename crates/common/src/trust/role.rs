use serde::{Deserialize, Serialize};

/// Strictly ordered roles. A check passes when the caller's role ranks at
/// or above the required one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Reader,
    Deployer,
    Admin,
    Owner,
}

impl Role {
    pub fn allows(&self, required: Role) -> bool {
        *self >= required
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Reader => "reader",
            Role::Deployer => "deployer",
            Role::Admin => "admin",
            Role::Owner => "owner",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl std::str::FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reader" => Ok(Role::Reader),
            "deployer" => Ok(Role::Deployer),
            "admin" => Ok(Role::Admin),
            "owner" => Ok(Role::Owner),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// Daemon-side operations that are subject to a role check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    PushSecrets,
    ReadSecrets,
    QueryAudit,
    AddIdentity,
    RevokeIdentity,
    ChangeRole,
    RotateKeys,
}

impl Operation {
    pub fn required_role(&self) -> Role {
        match self {
            Operation::ReadSecrets | Operation::QueryAudit => Role::Reader,
            Operation::PushSecrets => Role::Deployer,
            Operation::AddIdentity
            | Operation::RevokeIdentity
            | Operation::ChangeRole
            | Operation::RotateKeys => Role::Admin,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::PushSecrets => "push_secrets",
            Operation::ReadSecrets => "read_secrets",
            Operation::QueryAudit => "query_audit",
            Operation::AddIdentity => "add_identity",
            Operation::RevokeIdentity => "revoke_identity",
            Operation::ChangeRole => "change_role",
            Operation::RotateKeys => "rotate_keys",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_role_order() {
        assert!(Role::Owner > Role::Admin);
        assert!(Role::Admin > Role::Deployer);
        assert!(Role::Deployer > Role::Reader);
        assert!(Role::Owner.allows(Role::Admin));
        assert!(Role::Admin.allows(Role::Admin));
        assert!(!Role::Reader.allows(Role::Deployer));
    }

    #[test]
    fn test_required_roles() {
        assert!(!Role::Reader.allows(Operation::AddIdentity.required_role()));
        assert!(Role::Deployer.allows(Operation::PushSecrets.required_role()));
        assert!(!Role::Deployer.allows(Operation::RevokeIdentity.required_role()));
        assert!(Role::Reader.allows(Operation::QueryAudit.required_role()));
    }

    #[test]
    fn test_parse_and_serde() {
        assert_eq!("Admin".parse::<Role>().unwrap(), Role::Admin);
        assert!("root".parse::<Role>().is_err());
        assert_eq!(serde_json::to_string(&Role::Deployer).unwrap(), "\"deployer\"");
    }
}
