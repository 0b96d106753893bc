//! Channel and request vocabulary
//!
//! Only one channel kind and one request kind carry meaning for the
//! bridge. Everything else is kept as its wire name so it can be logged
//! and rejected.

use std::fmt;

/// Kind of a channel as named in the client's channel-open message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    /// `session`, the only kind the bridge accepts
    Session,
    /// Any other kind (`direct-tcpip`, `x11`, ...)
    Other(String),
}

impl ChannelKind {
    /// Wire name of the session channel kind
    pub const SESSION: &'static str = "session";

    /// Get the wire name of this kind
    pub fn as_str(&self) -> &str {
        match self {
            Self::Session => Self::SESSION,
            Self::Other(name) => name,
        }
    }

    /// Whether channels of this kind are accepted
    pub fn is_supported(&self) -> bool {
        matches!(self, Self::Session)
    }
}

impl From<&str> for ChannelKind {
    fn from(s: &str) -> Self {
        if s == Self::SESSION {
            Self::Session
        } else {
            Self::Other(s.to_string())
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of a channel-scoped request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// `exec`; the command text it carries is never read
    Exec,
    /// Any other request (`shell`, `pty-req`, `env`, `subsystem`, ...)
    Other(String),
}

impl RequestKind {
    /// Wire name of the exec request
    pub const EXEC: &'static str = "exec";

    /// Get the wire name of this kind
    pub fn as_str(&self) -> &str {
        match self {
            Self::Exec => Self::EXEC,
            Self::Other(name) => name,
        }
    }
}

impl From<&str> for RequestKind {
    fn from(s: &str) -> Self {
        if s == Self::EXEC {
            Self::Exec
        } else {
            Self::Other(s.to_string())
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_kind_from_wire_name() {
        assert_eq!(ChannelKind::from("session"), ChannelKind::Session);
        assert_eq!(
            ChannelKind::from("shell"),
            ChannelKind::Other("shell".to_string())
        );
        assert!(ChannelKind::Session.is_supported());
        assert!(!ChannelKind::from("direct-tcpip").is_supported());
    }

    #[test]
    fn test_kind_names_are_case_sensitive() {
        assert!(!ChannelKind::from("Session").is_supported());
        assert_eq!(RequestKind::from("EXEC"), RequestKind::Other("EXEC".into()));
    }

    #[test]
    fn test_request_kind_display() {
        assert_eq!(RequestKind::from("exec"), RequestKind::Exec);
        assert_eq!(RequestKind::Exec.to_string(), "exec");
        assert_eq!(RequestKind::from("pty-req").to_string(), "pty-req");
    }
}
