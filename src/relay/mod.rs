
use std::collections::HashMap;
use std::net::SocketAddr;

use stun::agent::TransactionId;
use tokio::time::{Duration, Instant};

use crate::error::*;

/// RFC 8656: the permission lifetime MUST be 300 seconds.
pub(crate) const PERMISSION_LIFETIME: Duration = Duration::from_secs(300);

/// RFC 8656: channel bindings last for 10 minutes unless refreshed.
pub(crate) const BIND_LIFETIME: Duration = Duration::from_secs(600);

/// TURN channel numbers live in 0x4000..=0x7FFF.
pub(crate) const MIN_CHANNEL_NUMBER: u16 = 0x4000;
pub(crate) const MAX_CHANNEL_NUMBER: u16 = 0x7FFF;

/// Long-term credentials learned from the server's 401/438 responses.
#[derive(Clone, Debug, Default)]
pub struct TurnCredentials {
    pub username: String,
    pub realm: String,
    pub nonce: String,
}

impl TurnCredentials {
    /// True once a 401 delivered realm and nonce, enabling authenticated
    /// requests.
    pub fn complete(&self) -> bool {
        !self.realm.is_empty() && !self.nonce.is_empty()
    }
}

/// Per-relay TURN session state owned by a relay entry.
#[derive(Default)]
pub struct TurnState {
    pub credentials: TurnCredentials,
    pub password: String,
    pub map: TurnMap,
}

#[derive(Clone, Debug, Default)]
struct Permission {
    expiry: Option<Instant>,
    transaction_id: Option<TransactionId>,
}

#[derive(Clone, Debug)]
struct Channel {
    number: u16,
    bound: bool,
    expiry: Option<Instant>,
    transaction_id: Option<TransactionId>,
}

/// A peer has at most one permission and at most one channel.
#[derive(Clone, Debug, Default)]
struct PeerState {
    permission: Option<Permission>,
    channel: Option<Channel>,
}

/// Keys per-peer permissions and channel bindings by peer address.
///
/// Channel numbers are allocated once per peer and never reused, so the
/// (peer, number) relation stays injective for the map's lifetime.
#[derive(Default)]
pub struct TurnMap {
    peers: HashMap<SocketAddr, PeerState>,
    next_channel: u16,
}

impl TurnMap {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
            next_channel: MIN_CHANNEL_NUMBER,
        }
    }

    /// True if a non-expired permission is installed for the peer.
    pub fn has_permission(&self, peer: &SocketAddr, now: Instant) -> bool {
        self.peers
            .get(peer)
            .and_then(|p| p.permission.as_ref())
            .and_then(|p| p.expiry)
            .map(|expiry| expiry > now)
            .unwrap_or(false)
    }

    /// Registers the transaction id of an in-flight CreatePermission.
    pub fn set_permission_transaction(&mut self, peer: SocketAddr, id: TransactionId) {
        let state = self.peers.entry(peer).or_default();
        let permission = state.permission.get_or_insert_with(Permission::default);
        permission.transaction_id = Some(id);
    }

    /// Matches a CreatePermission success response; installs the permission
    /// for half its lifetime so the send path refreshes it early.
    pub fn confirm_permission(&mut self, id: &TransactionId, now: Instant) -> Option<SocketAddr> {
        for (peer, state) in self.peers.iter_mut() {
            if let Some(permission) = &mut state.permission {
                if permission.transaction_id.as_ref() == Some(id) {
                    permission.transaction_id = None;
                    permission.expiry = Some(now + PERMISSION_LIFETIME / 2);
                    return Some(*peer);
                }
            }
        }
        None
    }

    /// Returns the channel number usable for ChannelData framing: bound and
    /// not past its refresh deadline.
    pub fn bound_channel(&self, peer: &SocketAddr, now: Instant) -> Option<u16> {
        let channel = self.peers.get(peer)?.channel.as_ref()?;
        if channel.bound && channel.expiry.map(|e| e > now).unwrap_or(false) {
            Some(channel.number)
        } else {
            None
        }
    }

    /// Returns the channel number reserved for the peer, bound or not.
    pub fn channel_number(&self, peer: &SocketAddr) -> Option<u16> {
        self.peers.get(peer)?.channel.as_ref().map(|c| c.number)
    }

    /// Reserves a fresh channel number for the peer.
    pub fn allocate_channel(&mut self, peer: SocketAddr) -> Result<u16> {
        if let Some(number) = self.channel_number(&peer) {
            return Ok(number);
        }
        if self.next_channel > MAX_CHANNEL_NUMBER {
            return Err(Error::ErrChannelNumbersExhausted);
        }

        let number = self.next_channel;
        self.next_channel += 1;

        let state = self.peers.entry(peer).or_default();
        state.channel = Some(Channel {
            number,
            bound: false,
            expiry: None,
            transaction_id: None,
        });
        Ok(number)
    }

    /// Registers the transaction id of an in-flight ChannelBind.
    pub fn set_channel_transaction(&mut self, peer: &SocketAddr, id: TransactionId) {
        if let Some(channel) = self.peers.get_mut(peer).and_then(|p| p.channel.as_mut()) {
            channel.transaction_id = Some(id);
        }
    }

    /// True while a ChannelBind for the peer awaits its response.
    pub fn channel_transaction_pending(&self, peer: &SocketAddr) -> bool {
        self.peers
            .get(peer)
            .and_then(|p| p.channel.as_ref())
            .map(|c| c.transaction_id.is_some())
            .unwrap_or(false)
    }

    /// Matches a ChannelBind success response; marks the channel bound for
    /// half its lifetime.
    pub fn confirm_channel_bind(
        &mut self,
        id: &TransactionId,
        now: Instant,
    ) -> Option<(SocketAddr, u16)> {
        for (peer, state) in self.peers.iter_mut() {
            if let Some(channel) = &mut state.channel {
                if channel.transaction_id.as_ref() == Some(id) {
                    channel.transaction_id = None;
                    channel.bound = true;
                    channel.expiry = Some(now + BIND_LIFETIME / 2);
                    return Some((*peer, channel.number));
                }
            }
        }
        None
    }

    /// Recovers the peer address behind an inbound ChannelData number.
    pub fn find_channel_peer(&self, number: u16) -> Option<SocketAddr> {
        self.peers
            .iter()
            .find(|(_, state)| {
                state
                    .channel
                    .as_ref()
                    .map(|c| c.number == number)
                    .unwrap_or(false)
            })
            .map(|(peer, _)| *peer)
    }

    /// True if the id belongs to any in-flight CreatePermission or
    /// ChannelBind transaction of this map.
    pub fn matches_transaction(&self, id: &TransactionId) -> bool {
        self.peers.values().any(|state| {
            state
                .permission
                .as_ref()
                .map(|p| p.transaction_id.as_ref() == Some(id))
                .unwrap_or(false)
                || state
                    .channel
                    .as_ref()
                    .map(|c| c.transaction_id.as_ref() == Some(id))
                    .unwrap_or(false)
        })
    }
}
