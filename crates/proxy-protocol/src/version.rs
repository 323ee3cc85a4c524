//! Protocol version handling.

use crate::error::ProtocolError;
use std::fmt;
use std::str::FromStr;

/// Version advertised by this server on every response and event.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion {
    major: 0,
    minor: 0,
    patch: 1,
};

/// A `MAJOR.MINOR.PATCH` protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProtocolVersion {
    /// Whether this server version accepts a request carrying `requested`.
    ///
    /// The rule is: equal major, and a requested minor no newer than ours.
    /// Patch level never affects compatibility.
    pub fn accepts(self, requested: ProtocolVersion) -> bool {
        requested.major == self.major && requested.minor <= self.minor
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for ProtocolVersion {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let mut next = || -> Result<u32, ProtocolError> {
            parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| ProtocolError::BadVersion(s.to_string()))
        };
        let version = ProtocolVersion {
            major: next()?,
            minor: next()?,
            patch: next()?,
        };
        if parts.next().is_some() {
            return Err(ProtocolError::BadVersion(s.to_string()));
        }
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        let v: ProtocolVersion = "1.2.3".parse().unwrap();
        assert_eq!(
            v,
            ProtocolVersion {
                major: 1,
                minor: 2,
                patch: 3
            }
        );
        assert_eq!(v.to_string(), "1.2.3");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("1.2".parse::<ProtocolVersion>().is_err());
        assert!("1.2.3.4".parse::<ProtocolVersion>().is_err());
        assert!("a.b.c".parse::<ProtocolVersion>().is_err());
        assert!("".parse::<ProtocolVersion>().is_err());
    }

    #[test]
    fn test_accepts_same_line() {
        assert!(PROTOCOL_VERSION.accepts("0.0.1".parse().unwrap()));
        assert!(PROTOCOL_VERSION.accepts("0.0.9".parse().unwrap()));
    }

    #[test]
    fn test_rejects_newer_minor_and_other_major() {
        assert!(!PROTOCOL_VERSION.accepts("0.1.0".parse().unwrap()));
        assert!(!PROTOCOL_VERSION.accepts("9.0.0".parse().unwrap()));
        assert!(!PROTOCOL_VERSION.accepts("1.0.0".parse().unwrap()));
    }
}
