
use std::fmt;
use std::net::SocketAddr;

use crc::{Crc, CRC_32_ISCSI};

use crate::error::*;

/// Indexes a candidate inside its description.
pub type CandidateId = usize;
/// Indexes a candidate pair inside the agent.
pub type PairId = usize;

pub(crate) const DEFAULT_LOCAL_PREFERENCE: u16 = 65535;

/// The agent negotiates a single data component.
pub(crate) const COMPONENT_DATA: u16 = 1;

/// Represents the type of an ICE candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CandidateType {
    Unspecified,
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
            CandidateType::Unspecified => "unknown",
        };
        write!(f, "{}", s)
    }
}

impl Default for CandidateType {
    fn default() -> Self {
        Self::Unspecified
    }
}

impl CandidateType {
    /// Returns the preference weight of a candidate type.
    ///
    /// RFC 8445 5.1.2.2. Guidelines for Choosing Type and Local Preferences:
    /// The RECOMMENDED values are 126 for host candidates, 110 for peer
    /// reflexive candidates, 100 for server reflexive candidates, and 0 for
    /// relayed candidates.
    #[must_use]
    pub const fn preference(self) -> u16 {
        match self {
            Self::Host => 126,
            Self::PeerReflexive => 110,
            Self::ServerReflexive => 100,
            Self::Relay | Self::Unspecified => 0,
        }
    }
}

/// A single UDP transport address offered or discovered for the session.
///
/// Candidates are plain data owned by their description; everything else
/// refers to them through address lookups or `CandidateId` indices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub kind: CandidateType,
    pub component: u16,
    pub foundation: String,
    pub priority: u32,
    pub resolved: SocketAddr,
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "udp {} {}", self.kind, self.resolved)
    }
}

impl Candidate {
    /// Creates a candidate for a resolved transport address, deriving its
    /// priority and foundation.
    pub fn new(kind: CandidateType, component: u16, resolved: SocketAddr) -> Self {
        Self {
            kind,
            component,
            foundation: compute_foundation(kind, &resolved),
            priority: compute_priority(kind, component),
            resolved,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.resolved
    }

    /// Returns the string form used in `a=candidate:` lines.
    pub fn marshal(&self) -> String {
        format!(
            "{} {} udp {} {} {} typ {}",
            self.foundation,
            self.component,
            self.priority,
            self.resolved.ip(),
            self.resolved.port(),
            self.kind
        )
    }
}

/// Computes the RFC 8445 5.1.2.1 candidate priority.
pub fn compute_priority(kind: CandidateType, component: u16) -> u32 {
    (1 << 24) * u32::from(kind.preference())
        + (1 << 8) * u32::from(DEFAULT_LOCAL_PREFERENCE)
        + (256 - u32::from(component))
}

/// An arbitrary string identical for candidates of the same type and base
/// address, used by the freezing algorithm to group similar candidates.
pub fn compute_foundation(kind: CandidateType, resolved: &SocketAddr) -> String {
    let mut buf = vec![];
    buf.extend_from_slice(kind.to_string().as_bytes());
    buf.extend_from_slice(resolved.ip().to_string().as_bytes());
    buf.extend_from_slice(b"udp");

    let checksum = Crc::<u32>::new(&CRC_32_ISCSI).checksum(&buf);
    format!("{}", checksum)
}

/// Creates a candidate from its `a=candidate:` attribute value.
pub fn unmarshal_candidate(raw: &str) -> Result<Candidate> {
    let raw = raw
        .trim()
        .trim_start_matches("a=candidate:")
        .trim_start_matches("candidate:");

    let split: Vec<&str> = raw.split_whitespace().collect();
    if split.len() < 8 {
        return Err(Error::ErrAttributeTooShortIceCandidate);
    }

    let foundation = split[0].to_owned();
    let component: u16 = split[1].parse().map_err(|_| Error::ErrParseComponent)?;
    let priority: u32 = split[3].parse().map_err(|_| Error::ErrParsePriority)?;
    let ip = split[4].parse()?;
    let port: u16 = split[5].parse().map_err(|_| Error::ErrParsePort)?;

    let kind = match split[7] {
        "host" => CandidateType::Host,
        "srflx" => CandidateType::ServerReflexive,
        "prflx" => CandidateType::PeerReflexive,
        "relay" => CandidateType::Relay,
        _ => return Err(Error::ErrUnknownCandidateType),
    };

    Ok(Candidate {
        kind,
        component,
        foundation,
        priority,
        resolved: SocketAddr::new(ip, port),
    })
}

/// Represents the state of a candidate pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CandidatePairState {
    /// The pair waits for remote credentials before it can be checked.
    Frozen,

    /// A check is scheduled or in flight for this pair.
    Pending,

    /// A check produced a successful response.
    Succeeded,

    /// The check transaction ran out of retransmissions or got an
    /// unrecoverable error response.
    Failed,
}

impl Default for CandidatePairState {
    fn default() -> Self {
        Self::Frozen
    }
}

impl fmt::Display for CandidatePairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::Frozen => "frozen",
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Combination of a remote candidate and an optional local candidate.
///
/// The local side stays unset for pairs sent from the shared socket: those
/// are undifferentiated until a success response carries a mapped address.
/// Only relayed-local pairs are created with a concrete local candidate.
#[derive(Clone, Debug)]
pub struct CandidatePair {
    pub local: Option<CandidateId>,
    pub remote: CandidateId,
    pub priority: u64,
    pub state: CandidatePairState,
    pub nominated: bool,
    pub nomination_requested: bool,
}

impl CandidatePair {
    pub fn new(local: Option<CandidateId>, remote: CandidateId, priority: u64) -> Self {
        Self {
            local,
            remote,
            priority,
            state: CandidatePairState::Frozen,
            nominated: false,
            nomination_requested: false,
        }
    }
}

/// RFC 8445 6.1.2.3. Computing Pair Priority and Ordering Pairs:
/// let G be the controlling-side candidate priority and D the controlled
/// one, pair priority = 2^32*MIN(G,D) + 2*MAX(G,D) + (G>D?1:0).
pub fn compute_pair_priority(local_priority: u32, remote_priority: u32, controlling: bool) -> u64 {
    let (g, d) = if controlling {
        (local_priority, remote_priority)
    } else {
        (remote_priority, local_priority)
    };

    // 1<<32 overflows u32; and if both g and d are u32::MAX,
    // the exact formula would overflow u64
    ((1 << 32_u64) - 1) * u64::from(std::cmp::min(g, d))
        + 2 * u64::from(std::cmp::max(g, d))
        + u64::from(g > d)
}
