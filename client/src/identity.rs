use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The two participants of a room. Exactly one process per role per room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Candidate,
    Interviewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Candidate => "candidate",
            Role::Interviewer => "interviewer",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Role::Candidate => "Candidate",
            Role::Interviewer => "Interviewer",
        }
    }

    pub fn counterpart(&self) -> Role {
        match self {
            Role::Candidate => Role::Interviewer,
            Role::Interviewer => Role::Candidate,
        }
    }

    /// The interviewer always dials; the candidate only ever answers.
    pub fn is_initiator(&self) -> bool {
        matches!(self, Role::Interviewer)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "candidate" => Ok(Role::Candidate),
            "interviewer" => Ok(Role::Interviewer),
            other => bail!("unknown role '{other}' (expected candidate or interviewer)"),
        }
    }
}

/// Address string of one participant: `"{room_code}-{role}"`.
pub fn derive_identity(room_code: &str, role: Role) -> String {
    format!("{}-{}", room_code, role.as_str())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    room_code: String,
    role: Role,
}

impl PeerIdentity {
    pub fn new(room_code: impl Into<String>, role: Role) -> Self {
        Self {
            room_code: room_code.into(),
            role,
        }
    }

    pub fn room_code(&self) -> &str {
        &self.room_code
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn address(&self) -> String {
        derive_identity(&self.room_code, self.role)
    }

    /// The other participant of the same room, computed without negotiation.
    pub fn remote(&self) -> PeerIdentity {
        PeerIdentity::new(self.room_code.clone(), self.role.counterpart())
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.room_code, self.role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_identity() {
        assert_eq!(derive_identity("42-7", Role::Candidate), "42-7-candidate");
        assert_eq!(derive_identity("42-7", Role::Interviewer), "42-7-interviewer");
        assert_eq!(
            derive_identity("123-456", Role::Candidate),
            derive_identity("123-456", Role::Candidate)
        );
    }

    #[test]
    fn test_roles_never_collide() {
        for room in ["1", "42-7", "abc", "candidate", "x-interviewer", "123-456"] {
            let a = derive_identity(room, Role::Candidate);
            let b = derive_identity(room, Role::Interviewer);
            assert_ne!(a, b, "room {room}");
        }
    }

    #[test]
    fn test_remote_identity() {
        let local = PeerIdentity::new("42-7", Role::Candidate);
        let remote = local.remote();
        assert_eq!(remote.role(), Role::Interviewer);
        assert_eq!(remote.address(), "42-7-interviewer");
        assert_eq!(remote.remote(), local);
        assert_eq!(local.to_string(), local.address());
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("candidate".parse::<Role>().unwrap(), Role::Candidate);
        assert_eq!(" Interviewer ".parse::<Role>().unwrap(), Role::Interviewer);
        assert!("observer".parse::<Role>().is_err());
        assert!(Role::Interviewer.is_initiator());
        assert!(!Role::Candidate.is_initiator());
    }
}
