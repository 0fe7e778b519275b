use std::num::ParseIntError;
use std::{io, net};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// Indicates the configured local port range is empty or inverted.
    #[error("invalid local port range")]
    ErrPortRangeInvalid,

    /// Indicates no free port could be bound inside the configured range.
    #[error("no free port in local port range")]
    ErrNoFreePort,

    /// Indicates more TURN servers were configured than relay entries exist.
    #[error("too many TURN servers")]
    ErrTooManyTurnServers,

    /// Indicates the agent is closed.
    #[error("the agent is closed")]
    ErrClosed,

    /// Indicates candidate gathering was started twice.
    #[error("candidate gathering already started")]
    ErrGatheringAlreadyStarted,

    /// Indicates send was called before a candidate pair was selected.
    #[error("send called before ICE is connected")]
    ErrNotConnected,

    /// Indicates the remote description is missing the ICE user fragment.
    #[error("remote ufrag is empty")]
    ErrRemoteUfragEmpty,

    /// Indicates the remote description is missing the ICE password.
    #[error("remote pwd is empty")]
    ErrRemotePwdEmpty,

    /// Indicates a connectivity check was attempted without remote credentials.
    #[error("missing remote ICE credentials")]
    ErrMissingRemoteCredentials,

    /// Indicates the description already holds the maximum number of candidates.
    #[error("too many candidates")]
    ErrTooManyCandidates,

    /// Indicates the session already holds the maximum number of candidate pairs.
    #[error("too many candidate pairs")]
    ErrTooManyCandidatePairs,

    /// Indicates no STUN entry slot is left for a new candidate pair.
    #[error("no free STUN entry left")]
    ErrTooManyStunEntries,

    /// Indicates a relay entry could not be found for a relayed local candidate.
    #[error("relay entry not found")]
    ErrRelayEntryNotFound,

    /// Indicates the relay has no channel number left to allocate.
    #[error("channel numbers exhausted")]
    ErrChannelNumbersExhausted,

    /// Indicates the TURN state is missing realm or nonce for an authenticated request.
    #[error("missing TURN realm and nonce")]
    ErrMissingTurnCredentials,

    #[error("failed to send packet")]
    ErrSendPacket,
    #[error("attribute not long enough to be ICE candidate")]
    ErrAttributeTooShortIceCandidate,
    #[error("could not parse component")]
    ErrParseComponent,
    #[error("could not parse priority")]
    ErrParsePriority,
    #[error("could not parse port")]
    ErrParsePort,
    #[error("could not parse type")]
    ErrParseType,
    #[error("unknown candidate type")]
    ErrUnknownCandidateType,
    #[error("could not parse description")]
    ErrParseDescription,

    #[error("parse int: {0}")]
    ParseInt(#[from] ParseIntError),
    #[error("parse addr: {0}")]
    ParseIp(#[from] net::AddrParseError),
    #[error("{0}")]
    Io(#[source] IoError),
    #[error("{0}")]
    Stun(#[from] stun::Error),
    #[error("{0}")]
    Turn(#[from] turn::Error),
    #[error("{0}")]
    Util(#[from] util::Error),

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}
