use tokio::time::Duration;

use crate::agent::agent_internal::*;
use crate::error::*;

/// Default STUN/TURN port.
pub(crate) const DEFAULT_SERVER_PORT: u16 = 3478;

/// STUN server used for server-reflexive discovery.
#[derive(Clone, Debug)]
pub struct StunServerConfig {
    pub host: String,
    pub port: u16,
}

impl StunServerConfig {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }
}

/// TURN server used for relaying, with long-term credentials.
#[derive(Clone, Debug)]
pub struct TurnServerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// Collects the arguments to `Agent` construction.
///
/// The timing knobs default to the protocol constants; tests shorten them.
pub struct AgentConfig {
    pub stun_server: Option<StunServerConfig>,
    pub turn_servers: Vec<TurnServerConfig>,

    /// Inclusive local port range the UDP socket is bound in; `(0, 0)`
    /// leaves the port to the operating system.
    pub local_port_range: (u16, u16),

    /// Gather host candidates on loopback interfaces.
    pub include_loopback: bool,

    /// Cadence of Binding indications on the nominated entry.
    pub keepalive_interval: Duration,

    /// Grace period for further remote candidates once every known pair has
    /// failed; zero once the remote signaled end-of-candidates.
    pub fail_timeout: Duration,

    /// Floor of the per-entry retransmission timer, doubling each retry.
    pub min_retransmission_timeout: Duration,

    /// Number of request transmissions before an entry fails.
    pub max_retransmission_count: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            stun_server: None,
            turn_servers: vec![],
            local_port_range: (0, 0),
            include_loopback: false,
            keepalive_interval: STUN_KEEPALIVE_PERIOD,
            fail_timeout: ICE_FAIL_TIMEOUT,
            min_retransmission_timeout: MIN_STUN_RETRANSMISSION_TIMEOUT,
            max_retransmission_count: MAX_STUN_RETRANSMISSION_COUNT,
        }
    }
}

impl AgentConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        let (begin, end) = self.local_port_range;
        if begin > end {
            return Err(Error::ErrPortRangeInvalid);
        }
        if self.turn_servers.len() > MAX_RELAY_ENTRIES_COUNT {
            return Err(Error::ErrTooManyTurnServers);
        }
        Ok(())
    }
}
