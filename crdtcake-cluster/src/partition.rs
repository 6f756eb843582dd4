use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;

const SEPARATOR: char = '|';
const MAX_SEGMENTS: usize = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
/// The partition string could not be parsed.
pub enum PartitionParseError {
    #[error("Partition string has {0} segments, expected at most 4")]
    TooManySegments(usize),

    #[error("Partition string is missing the partition id")]
    MissingId,

    #[error("Invalid partition address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },
}

#[derive(Debug, Clone)]
/// The identity of a single storage partition.
///
/// Equality, ordering and hashing only consider the group and id of the
/// partition, the addresses are metadata used to reach it.
///
/// The string form is `group|id|storage address|control address` where
/// absent addresses are left empty:
///
/// ```rust
/// use crdtcake_cluster::PartitionId;
///
/// let partition: PartitionId = "main|a|127.0.0.1:9000|".parse().unwrap();
/// assert_eq!(partition.id(), "a");
/// assert!(partition.control_addr().is_none());
/// assert_eq!(partition.to_string(), "main|a|127.0.0.1:9000|");
/// ```
pub struct PartitionId {
    group: Arc<str>,
    id: Arc<str>,
    storage_addr: Option<SocketAddr>,
    control_addr: Option<SocketAddr>,
}

impl PartitionId {
    pub fn new(group: impl AsRef<str>, id: impl AsRef<str>) -> Self {
        Self {
            group: Arc::from(group.as_ref()),
            id: Arc::from(id.as_ref()),
            storage_addr: None,
            control_addr: None,
        }
    }

    /// Sets the address the partition's storage server listens on.
    pub fn with_storage_addr(mut self, addr: SocketAddr) -> Self {
        self.storage_addr = Some(addr);
        self
    }

    /// Sets the address of the partition's control endpoint.
    pub fn with_control_addr(mut self, addr: SocketAddr) -> Self {
        self.control_addr = Some(addr);
        self
    }

    #[inline]
    pub fn group(&self) -> &str {
        &self.group
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn storage_addr(&self) -> Option<SocketAddr> {
        self.storage_addr
    }

    #[inline]
    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.control_addr
    }

    /// A hash of the partition's id alone, ignoring its group.
    ///
    /// Partitions sharing an id in different groups hash the same, which
    /// makes groups route keys identically.
    pub fn id_hash(&self) -> u32 {
        crate::hash32(self.id())
    }

    /// The default partition hash, covering both the group and the id.
    pub fn identity_hash(&self) -> u32 {
        crate::hash32(&(self.group(), self.id()))
    }

    /// Checks the addresses match as well as the identity.
    pub fn same_addresses(&self, other: &Self) -> bool {
        self.storage_addr == other.storage_addr && self.control_addr == other.control_addr
    }
}

impl PartialEq for PartitionId {
    fn eq(&self, other: &Self) -> bool {
        self.group == other.group && self.id == other.id
    }
}

impl Eq for PartitionId {}

impl Hash for PartitionId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.group.hash(state);
        self.id.hash(state);
    }
}

impl PartialOrd for PartitionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PartitionId {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.group, &self.id).cmp(&(&other.group, &other.id))
    }
}

impl Display for PartitionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}{}", self.group, SEPARATOR, self.id, SEPARATOR)?;
        if let Some(addr) = self.storage_addr {
            write!(f, "{}", addr)?;
        }
        write!(f, "{}", SEPARATOR)?;
        if let Some(addr) = self.control_addr {
            write!(f, "{}", addr)?;
        }
        Ok(())
    }
}

impl FromStr for PartitionId {
    type Err = PartitionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments = s.split(SEPARATOR).collect::<Vec<_>>();
        if segments.len() > MAX_SEGMENTS {
            return Err(PartitionParseError::TooManySegments(segments.len()));
        }
        if segments.len() < 2 {
            return Err(PartitionParseError::MissingId);
        }

        let mut partition = PartitionId::new(segments[0], segments[1]);
        partition.storage_addr = parse_addr(segments.get(2).copied())?;
        partition.control_addr = parse_addr(segments.get(3).copied())?;
        Ok(partition)
    }
}

fn parse_addr(segment: Option<&str>) -> Result<Option<SocketAddr>, PartitionParseError> {
    let segment = match segment.map(str::trim) {
        None | Some("") => return Ok(None),
        Some(segment) => segment,
    };

    if let Ok(addr) = segment.parse::<SocketAddr>() {
        return Ok(Some(addr));
    }

    let invalid = |reason: String| PartitionParseError::InvalidAddress {
        address: segment.to_string(),
        reason,
    };

    let resolved = segment
        .to_socket_addrs()
        .map_err(|e| invalid(e.to_string()))?
        .collect::<Vec<_>>();

    resolved
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| resolved.first())
        .copied()
        .map(Some)
        .ok_or_else(|| invalid("Address did not resolve".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_identity_ignores_addresses() {
        let a = PartitionId::new("group", "a").with_storage_addr(addr("127.0.0.1:9000"));
        let b = PartitionId::new("group", "a");
        assert_eq!(a, b);
        assert_eq!(crate::hash32(&a), crate::hash32(&b));
        assert!(!a.same_addresses(&b));

        assert_ne!(PartitionId::new("group", "a"), PartitionId::new("other", "a"));
        assert!(PartitionId::new("a", "z") < PartitionId::new("b", "a"));
    }

    #[test]
    fn test_parse() {
        let partition: PartitionId = "partitioningA|test||".parse().unwrap();
        assert_eq!(partition.group(), "partitioningA");
        assert_eq!(partition.id(), "test");
        assert!(partition.storage_addr().is_none());
        assert!(partition.control_addr().is_none());

        let partition: PartitionId =
            "partitioningA|test|255.255.255.255:9000|".parse().unwrap();
        assert_eq!(partition.storage_addr(), Some(addr("255.255.255.255:9000")));
        assert!(partition.control_addr().is_none());

        let partition: PartitionId =
            "partitioningA|test||255.255.255.255:9000".parse().unwrap();
        assert!(partition.storage_addr().is_none());
        assert_eq!(partition.control_addr(), Some(addr("255.255.255.255:9000")));

        let partition: PartitionId = "partitioningA|test| |  ".parse().unwrap();
        assert!(partition.storage_addr().is_none(), "Blank segments are absent.");
        assert!(partition.control_addr().is_none(), "Blank segments are absent.");
    }

    #[test]
    fn test_parse_tolerates_missing_segments() {
        let partition: PartitionId = "partitioningA|test".parse().unwrap();
        assert_eq!(partition, PartitionId::new("partitioningA", "test"));
        assert!(partition.storage_addr().is_none());
    }

    #[test]
    fn test_parse_resolves_hosts() {
        let partition: PartitionId = "group|a|localhost:9000|".parse().unwrap();
        let storage_addr = partition.storage_addr().expect("Address should resolve");
        assert_eq!(storage_addr.port(), 9000);
        assert!(storage_addr.ip().is_loopback());
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            "a|b|c|d|e".parse::<PartitionId>().unwrap_err(),
            PartitionParseError::TooManySegments(5),
        );
        assert_eq!(
            "lonely".parse::<PartitionId>().unwrap_err(),
            PartitionParseError::MissingId,
        );
        assert!(matches!(
            "a|b|not an address|".parse::<PartitionId>(),
            Err(PartitionParseError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_round_trip() {
        let storage = addr("10.0.0.1:9000");
        let control = addr("[::1]:9001");

        let partitions = [
            PartitionId::new("g", "a"),
            PartitionId::new("g", "b").with_storage_addr(storage),
            PartitionId::new("g", "c").with_control_addr(control),
            PartitionId::new("g", "d")
                .with_storage_addr(storage)
                .with_control_addr(control),
        ];

        for partition in partitions {
            let parsed: PartitionId = partition.to_string().parse().unwrap();
            assert_eq!(parsed, partition, "Identity should survive a round trip.");
            assert!(
                parsed.same_addresses(&partition),
                "Addresses should survive a round trip: {}",
                partition,
            );
        }
    }
}
