//! Roles an agent can hold in a group.

use serde::{Deserialize, Serialize};

/// Role of an agent in a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Reader,
    Writer,
    Admin,
    /// May append but not read private content.
    WriteOnly,
    Revoked,
}

impl Role {
    pub fn can_read(&self) -> bool {
        matches!(self, Role::Reader | Role::Writer | Role::Admin)
    }

    pub fn can_write(&self) -> bool {
        matches!(self, Role::Writer | Role::Admin | Role::WriteOnly)
    }

    pub fn can_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Reader => "reader",
            Role::Writer => "writer",
            Role::Admin => "admin",
            Role::WriteOnly => "writeOnly",
            Role::Revoked => "revoked",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = crate::error::PermsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reader" => Ok(Role::Reader),
            "writer" => Ok(Role::Writer),
            "admin" => Ok(Role::Admin),
            "writeOnly" => Ok(Role::WriteOnly),
            "revoked" => Ok(Role::Revoked),
            other => Err(crate::error::PermsError::InvalidOp(format!(
                "unknown role {other}"
            ))),
        }
    }
}
