use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    net::SocketAddr,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};
use uuid::Uuid;

/// Version of a member record, bumped on every state or metadata change.
pub type Incarnation = u64;
/// Liveness counter a member advances once per gossip round.
pub type Heartbeat = u64;

/// Whether an identifier was configured or generated for this process only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdKind {
    Identified,
    Anonymous,
}

/// Logical identity of a cluster participant.
///
/// Two ids are equal when their identifier strings are equal, regardless of
/// their kind or of the address the member listens on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberId {
    id: String,
    kind: IdKind,
}

impl MemberId {
    /// An identified member id, stable across restarts.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: IdKind::Identified,
        }
    }

    /// A fresh ephemeral id that lives as long as this process.
    pub fn anonymous() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: IdKind::Anonymous,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> IdKind {
        self.kind
    }
}

impl PartialEq for MemberId {
    fn eq(&self, other: &MemberId) -> bool {
        self.id == other.id
    }
}

impl Eq for MemberId {}

impl Hash for MemberId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl PartialOrd for MemberId {
    fn partial_cmp(&self, other: &MemberId) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemberId {
    fn cmp(&self, other: &MemberId) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl From<&str> for MemberId {
    fn from(t: &str) -> Self {
        MemberId::new(t)
    }
}

impl From<String> for MemberId {
    fn from(t: String) -> Self {
        MemberId::new(t)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// A `host:port` pair a member can be reached on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    host: String,
    port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::new_config(Some(format!("missing port in `{}`", s).into())))?;

        if host.is_empty() {
            return Err(Error::new_config(Some(
                format!("missing host in `{}`", s).into(),
            )));
        }

        let port = port
            .parse()
            .map_err(|e| Error::new_config(Some(Box::new(e))))?;

        Ok(Address::new(host.trim_matches(|c| c == '[' || c == ']'), port))
    }
}

impl From<SocketAddr> for Address {
    fn from(t: SocketAddr) -> Self {
        Address::new(t.ip().to_string(), t.port())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Milliseconds since the unix epoch, used to seed incarnations and
/// heartbeats so a restarted process outranks its previous life.
pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn id_equality_ignores_kind() {
        let a = MemberId::new("1");
        let b = MemberId {
            id: "1".into(),
            kind: IdKind::Anonymous,
        };

        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn anonymous_ids_are_unique() {
        let a = MemberId::anonymous();
        let b = MemberId::anonymous();

        assert_eq!(a.kind(), IdKind::Anonymous);
        assert_ne!(a, b);
        assert_eq!(MemberId::from("node").kind(), IdKind::Identified);
    }

    #[test]
    fn parse_address() {
        let addr: Address = "localhost:5679".parse().unwrap();
        assert_eq!(addr, Address::new("localhost", 5679));
        assert_eq!(addr.to_string(), "localhost:5679");

        let v6: Address = "[::1]:80".parse().unwrap();
        assert_eq!(v6.host(), "::1");
        assert_eq!(v6.to_string(), "[::1]:80");

        assert!("localhost".parse::<Address>().is_err());
        assert!(":80".parse::<Address>().is_err());
        assert!("localhost:http".parse::<Address>().is_err());
    }
}
