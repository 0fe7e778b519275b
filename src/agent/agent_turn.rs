use std::net::SocketAddr;

use stun::agent::TransactionId;
use stun::attributes::*;
use stun::error_code::*;
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::*;
use stun::textattrs::{Nonce, Realm, TextAttribute, Username};
use stun::xoraddr::XorMappedAddress;
use tokio::time::Instant;
use turn::proto::chandata::ChannelData;
use turn::proto::channum::ChannelNumber;
use turn::proto::data::Data;
use turn::proto::lifetime::Lifetime;
use turn::proto::peeraddr::PeerAddress;
use turn::proto::relayaddr::RelayedAddress;
use turn::proto::reqtrans::RequestedTransport;
use turn::proto::PROTO_UDP;

use super::agent_internal::*;
use crate::candidate::CandidateType;
use crate::error::*;

/// DONT-FRAGMENT carries no value.
struct DontFragmentAttr;

impl Setter for DontFragmentAttr {
    fn add_to(&self, m: &mut Message) -> std::result::Result<(), stun::Error> {
        m.add(ATTR_DONT_FRAGMENT, &[]);
        Ok(())
    }
}

impl AgentInternal {
    /// Verifies an authenticated TURN response against the entry's
    /// long-term credentials.
    pub(crate) fn verify_turn_credentials(
        &self,
        state: &AgentState,
        id: EntryId,
        msg: &mut Message,
    ) -> Result<()> {
        if msg.typ.class == CLASS_INDICATION || msg.typ.class == CLASS_ERROR_RESPONSE {
            return Ok(());
        }

        let turn = state.entries[id]
            .turn
            .as_ref()
            .ok_or_else(|| Error::Other("no credentials for entry".to_owned()))?;
        if !msg.contains(ATTR_MESSAGE_INTEGRITY) {
            return Err(Error::Other("missing integrity in STUN message".to_owned()));
        }

        MessageIntegrity::new_long_term_integrity(
            turn.credentials.username.clone(),
            turn.credentials.realm.clone(),
            turn.password.clone(),
        )
        .check(msg)?;
        Ok(())
    }

    fn turn_credentials(
        &self,
        state: &AgentState,
        id: EntryId,
    ) -> Result<(String, String, String, String)> {
        let turn = state.entries[id]
            .turn
            .as_ref()
            .ok_or_else(|| Error::Other("missing TURN state on relay entry".to_owned()))?;
        if !turn.credentials.complete() {
            return Err(Error::ErrMissingTurnCredentials);
        }
        Ok((
            turn.credentials.username.clone(),
            turn.credentials.realm.clone(),
            turn.credentials.nonce.clone(),
            turn.password.clone(),
        ))
    }

    /// Sends an Allocate or Refresh request. The first Allocate goes out
    /// anonymous; once the 401 delivered realm and nonce, requests carry
    /// the long-term credentials.
    pub(crate) fn send_turn_allocate_request(
        &self,
        state: &mut AgentState,
        id: EntryId,
        method: Method,
    ) -> Result<()> {
        log::debug!(
            "sending TURN {} request",
            if method == METHOD_ALLOCATE {
                "Allocate"
            } else {
                "Refresh"
            }
        );

        if state.entries[id].kind != EntryKind::Relay {
            log::error!("attempted to send a TURN request for a non-relay entry");
            return Err(Error::ErrRelayEntryNotFound);
        }

        let (authenticated, username, realm, nonce, password) = {
            let turn = state.entries[id]
                .turn
                .as_ref()
                .ok_or_else(|| Error::Other("missing TURN state on relay entry".to_owned()))?;
            (
                turn.credentials.complete(),
                turn.credentials.username.clone(),
                turn.credentials.realm.clone(),
                turn.credentials.nonce.clone(),
                turn.password.clone(),
            )
        };

        let mut setters: Vec<Box<dyn Setter>> = vec![
            Box::new(MessageType::new(method, CLASS_REQUEST)),
            Box::new(state.entries[id].transaction_id),
            Box::new(RequestedTransport {
                protocol: PROTO_UDP,
            }),
            Box::new(DontFragmentAttr),
            Box::new(Lifetime(TURN_LIFETIME)),
        ];
        if authenticated {
            setters.push(Box::new(Username::new(ATTR_USERNAME, username.clone())));
            setters.push(Box::new(Realm::new(ATTR_REALM, realm.clone())));
            setters.push(Box::new(Nonce::new(ATTR_NONCE, nonce)));
            setters.push(Box::new(MessageIntegrity::new_long_term_integrity(
                username, realm, password,
            )));
        }
        setters.push(Box::new(FINGERPRINT));

        let mut msg = Message::new();
        msg.build(&setters)?;

        let record = state.entries[id].record;
        self.direct_send(&record, &msg.raw, None)
    }

    pub(crate) fn process_turn_allocate(&self, state: &mut AgentState, msg: &Message, id: EntryId) {
        let method_name = if msg.typ.method == METHOD_ALLOCATE {
            "Allocate"
        } else {
            "Refresh"
        };

        if state.entries[id].kind != EntryKind::Relay {
            log::warn!(
                "received TURN {} message for a non-relay entry, ignoring",
                method_name
            );
            return;
        }
        if state.entries[id].turn.is_none() {
            log::error!("missing TURN state on relay entry");
            return;
        }

        match msg.typ.class {
            CLASS_SUCCESS_RESPONSE => {
                log::debug!("received TURN {} success response", method_name);

                if msg.typ.method == METHOD_REFRESH {
                    log::debug!("TURN refresh successful");
                    // Nothing to do other than rearm.
                    if state.entries[id].state == EntryState::SucceededKeepalive {
                        state.entries[id].transaction_id = TransactionId::new();
                        self.arm_transmission(state, id, TURN_REFRESH_PERIOD);
                    }
                    return;
                }

                log::info!("TURN allocation successful");
                if state.entries[id].state != EntryState::SucceededKeepalive {
                    state.entries[id].state = EntryState::Succeeded;
                    state.entries[id].next_transmission = None;
                }

                let selected_nominated = state
                    .selected_pair
                    .map(|pid| state.pairs[pid].nominated)
                    .unwrap_or(false);
                if !selected_nominated {
                    // Refresh requests are wanted right away.
                    state.entries[id].state = EntryState::SucceededKeepalive;
                    state.entries[id].transaction_id = TransactionId::new();
                    self.arm_transmission(state, id, TURN_REFRESH_PERIOD);
                }

                let mut xor_addr = XorMappedAddress::default();
                if xor_addr.get_from(msg).is_ok() {
                    log::trace!("response has mapped address");
                    let mapped = canonical_addr(SocketAddr::new(xor_addr.ip, xor_addr.port));
                    self.add_local_reflexive_candidate(
                        state,
                        CandidateType::ServerReflexive,
                        mapped,
                    );
                }

                let mut relayed_attr = RelayedAddress::default();
                if relayed_attr.get_from(msg).is_err() {
                    log::error!("expected relayed address in TURN {} response", method_name);
                    state.entries[id].state = EntryState::Failed;
                    return;
                }
                let relayed =
                    canonical_addr(SocketAddr::new(relayed_attr.ip, relayed_attr.port));
                state.entries[id].relayed = Some(relayed);

                if let Err(err) = self.add_local_relayed_candidate(state, relayed) {
                    log::warn!("failed to add local relayed candidate: {}", err);
                }
                self.update_gathering_done(state);
            }
            CLASS_ERROR_RESPONSE => {
                let mut code = ErrorCodeAttribute::default();
                let _ = code.get_from(msg);

                match code.code {
                    CODE_UNAUTHORIZED => {
                        log::debug!("got TURN {} Unauthorized response", method_name);

                        let already_authenticated = state.entries[id]
                            .turn
                            .as_ref()
                            .map(|t| t.credentials.complete())
                            .unwrap_or(false);
                        if already_authenticated {
                            log::error!("TURN authentication failed");
                            state.entries[id].state = EntryState::Failed;
                            self.update_gathering_done(state);
                            return;
                        }

                        let realm = TextAttribute::get_from_as(msg, ATTR_REALM);
                        let nonce = TextAttribute::get_from_as(msg, ATTR_NONCE);
                        match (realm, nonce) {
                            (Ok(realm), Ok(nonce)) => {
                                if let Some(turn) = state.entries[id].turn.as_mut() {
                                    turn.credentials.realm = realm.text;
                                    turn.credentials.nonce = nonce.text;
                                }
                                // Resend the request when possible.
                                self.arm_transmission(state, id, tokio::time::Duration::from_secs(0));
                            }
                            _ => {
                                log::error!("expected realm and nonce in TURN error response");
                                state.entries[id].state = EntryState::Failed;
                                self.update_gathering_done(state);
                            }
                        }
                    }
                    CODE_STALE_NONCE => {
                        log::debug!("got TURN {} Stale Nonce response", method_name);

                        match TextAttribute::get_from_as(msg, ATTR_NONCE) {
                            Ok(nonce) => {
                                if let Some(turn) = state.entries[id].turn.as_mut() {
                                    turn.credentials.nonce = nonce.text;
                                    if let Ok(realm) = TextAttribute::get_from_as(msg, ATTR_REALM) {
                                        turn.credentials.realm = realm.text;
                                    }
                                }
                                self.arm_transmission(state, id, tokio::time::Duration::from_secs(0));
                            }
                            Err(_) => {
                                log::error!("expected nonce in TURN error response");
                                state.entries[id].state = EntryState::Failed;
                                self.update_gathering_done(state);
                            }
                        }
                    }
                    code => {
                        log::warn!(
                            "got TURN {} error response, code={}",
                            method_name,
                            code.0
                        );
                        log::info!("TURN allocation failed");
                        state.entries[id].state = EntryState::Failed;
                        self.update_gathering_done(state);
                    }
                }
            }
            class => {
                log::warn!(
                    "got unexpected TURN {} message, class={}",
                    method_name,
                    class
                );
            }
        }
    }

    /// Installs a permission for the peer on the relay. Each request gets
    /// its own transaction id, registered in the TURN map.
    pub(crate) fn send_turn_create_permission(
        &self,
        state: &mut AgentState,
        id: EntryId,
        peer: &SocketAddr,
        ds: Option<u32>,
    ) -> Result<()> {
        log::debug!("sending TURN CreatePermission request");

        let (username, realm, nonce, password) = self.turn_credentials(state, id)?;

        let transaction_id = TransactionId::new();
        if let Some(turn) = state.entries[id].turn.as_mut() {
            turn.map.set_permission_transaction(*peer, transaction_id);
        }

        let mut msg = Message::new();
        msg.build(&[
            Box::new(MessageType::new(METHOD_CREATE_PERMISSION, CLASS_REQUEST)),
            Box::new(transaction_id),
            Box::new(PeerAddress {
                ip: peer.ip(),
                port: peer.port(),
            }),
            Box::new(Username::new(ATTR_USERNAME, username.clone())),
            Box::new(Realm::new(ATTR_REALM, realm.clone())),
            Box::new(Nonce::new(ATTR_NONCE, nonce)),
            Box::new(MessageIntegrity::new_long_term_integrity(
                username, realm, password,
            )),
            Box::new(FINGERPRINT),
        ])?;

        let record = state.entries[id].record;
        self.direct_send(&record, &msg.raw, ds)
    }

    pub(crate) fn process_turn_create_permission(
        &self,
        state: &mut AgentState,
        msg: &Message,
        id: EntryId,
    ) {
        if state.entries[id].kind != EntryKind::Relay {
            log::warn!("received TURN CreatePermission message for a non-relay entry, ignoring");
            return;
        }

        match msg.typ.class {
            CLASS_SUCCESS_RESPONSE => {
                log::debug!("received TURN CreatePermission success response");
                let confirmed = state.entries[id]
                    .turn
                    .as_mut()
                    .and_then(|t| t.map.confirm_permission(&msg.transaction_id, Instant::now()));
                match confirmed {
                    Some(peer) => log::debug!("TURN permission installed for {}", peer),
                    None => log::warn!(
                        "transaction id from TURN CreatePermission response does not match"
                    ),
                }
            }
            CLASS_ERROR_RESPONSE => {
                let mut code = ErrorCodeAttribute::default();
                let _ = code.get_from(msg);
                log::warn!(
                    "got TURN CreatePermission error response, code={}",
                    code.code.0
                );
            }
            class => {
                log::warn!(
                    "got unexpected TURN CreatePermission message, class={}",
                    class
                );
            }
        }
    }

    /// Binds a channel for the peer, allocating a fresh channel number in
    /// 0x4000..=0x7FFF on first use.
    pub(crate) fn send_turn_channel_bind(
        &self,
        state: &mut AgentState,
        id: EntryId,
        peer: &SocketAddr,
        ds: Option<u32>,
    ) -> Result<()> {
        log::debug!("sending TURN ChannelBind request");

        let (username, realm, nonce, password) = self.turn_credentials(state, id)?;

        let (number, transaction_id) = {
            let turn = state.entries[id]
                .turn
                .as_mut()
                .ok_or_else(|| Error::Other("missing TURN state on relay entry".to_owned()))?;
            let number = turn.map.allocate_channel(*peer)?;
            let transaction_id = TransactionId::new();
            turn.map.set_channel_transaction(peer, transaction_id);
            (number, transaction_id)
        };

        let mut msg = Message::new();
        msg.build(&[
            Box::new(MessageType::new(METHOD_CHANNEL_BIND, CLASS_REQUEST)),
            Box::new(transaction_id),
            Box::new(ChannelNumber(number)),
            Box::new(PeerAddress {
                ip: peer.ip(),
                port: peer.port(),
            }),
            Box::new(Username::new(ATTR_USERNAME, username.clone())),
            Box::new(Realm::new(ATTR_REALM, realm.clone())),
            Box::new(Nonce::new(ATTR_NONCE, nonce)),
            Box::new(MessageIntegrity::new_long_term_integrity(
                username, realm, password,
            )),
            Box::new(FINGERPRINT),
        ])?;

        let record = state.entries[id].record;
        self.direct_send(&record, &msg.raw, ds)
    }

    pub(crate) fn process_turn_channel_bind(
        &self,
        state: &mut AgentState,
        msg: &Message,
        id: EntryId,
    ) {
        if state.entries[id].kind != EntryKind::Relay {
            log::warn!("received TURN ChannelBind message for a non-relay entry, ignoring");
            return;
        }

        match msg.typ.class {
            CLASS_SUCCESS_RESPONSE => {
                let confirmed = state.entries[id]
                    .turn
                    .as_mut()
                    .and_then(|t| t.map.confirm_channel_bind(&msg.transaction_id, Instant::now()));
                match confirmed {
                    Some((peer, number)) => {
                        log::info!("TURN channel 0x{:04X} bound for {}", number, peer);
                    }
                    None => {
                        log::warn!("transaction id from TURN ChannelBind response does not match");
                    }
                }
            }
            CLASS_ERROR_RESPONSE => {
                let mut code = ErrorCodeAttribute::default();
                let _ = code.get_from(msg);
                log::warn!("got TURN ChannelBind error response, code={}", code.code.0);
            }
            class => {
                log::warn!("got unexpected TURN ChannelBind message, class={}", class);
            }
        }
    }

    /// Peer traffic relayed before a channel exists arrives as Data
    /// indications; feed it back through the input path.
    pub(crate) fn process_turn_data(&self, state: &mut AgentState, msg: &Message, id: EntryId) {
        if state.entries[id].kind != EntryKind::Relay {
            log::warn!("received TURN Data message for a non-relay entry, ignoring");
            return;
        }
        if msg.typ.class != CLASS_INDICATION {
            log::warn!("received non-indication TURN Data message, ignoring");
            return;
        }

        log::debug!("received TURN Data indication");

        let mut peer = PeerAddress::default();
        if peer.get_from(msg).is_err() {
            log::warn!("missing peer address in TURN Data indication");
            return;
        }
        let mut data = Data::default();
        if data.get_from(msg).is_err() {
            log::warn!("missing data in TURN Data indication");
            return;
        }

        let relayed = state.entries[id].relayed;
        let src = canonical_addr(SocketAddr::new(peer.ip, peer.port));
        self.input(state, &data.0, src, relayed);
    }

    /// Inbound ChannelData: recover the peer behind the channel number and
    /// re-enter the input path.
    pub(crate) fn process_channel_data(&self, state: &mut AgentState, id: EntryId, buf: &[u8]) {
        log::debug!("received ChannelData datagram");

        let mut ch_data = ChannelData {
            raw: buf.to_vec(),
            ..Default::default()
        };
        if let Err(err) = ch_data.decode() {
            log::warn!("invalid ChannelData datagram: {}", err);
            return;
        }

        let number = ch_data.number.0;
        let peer = state.entries[id]
            .turn
            .as_ref()
            .and_then(|t| t.map.find_channel_peer(number));
        let peer = match peer {
            Some(peer) => peer,
            None => {
                log::warn!("channel 0x{:04X} not found", number);
                return;
            }
        };

        let relayed = state.entries[id].relayed;
        let data = ch_data.data.clone();
        self.input(state, &data, peer, relayed);
    }

    /// Sends application or STUN data through the relay as a Send
    /// indication, installing the peer permission first when needed.
    pub(crate) fn relay_send(
        &self,
        state: &mut AgentState,
        id: EntryId,
        dst: &SocketAddr,
        data: &[u8],
        ds: Option<u32>,
    ) -> Result<()> {
        if state.entries[id].turn.is_none() {
            log::error!("missing TURN state on relay entry");
            return Err(Error::ErrRelayEntryNotFound);
        }

        log::trace!("sending datagram via relay, size={}", data.len());

        let has_permission = state.entries[id]
            .turn
            .as_ref()
            .map(|t| t.map.has_permission(dst, Instant::now()))
            .unwrap_or(false);
        if !has_permission {
            self.send_turn_create_permission(state, id, dst, ds)?;
        }

        let mut msg = Message::new();
        msg.build(&[
            Box::new(MessageType::new(METHOD_SEND, CLASS_INDICATION)),
            Box::new(TransactionId::new()),
            Box::new(PeerAddress {
                ip: dst.ip(),
                port: dst.port(),
            }),
            Box::new(Data(data.to_vec())),
            Box::new(DontFragmentAttr),
        ])?;

        let record = state.entries[id].record;
        self.direct_send(&record, &msg.raw, ds)
    }

    /// Sends application data through the relay, preferring ChannelData
    /// framing once the channel is bound and falling back to Send
    /// indications until then.
    pub(crate) fn channel_send(
        &self,
        state: &mut AgentState,
        id: EntryId,
        dst: &SocketAddr,
        data: &[u8],
        ds: Option<u32>,
    ) -> Result<()> {
        let now = Instant::now();
        let (bound, bind_in_flight) = match state.entries[id].turn.as_ref() {
            Some(turn) => (
                turn.map.bound_channel(dst, now),
                turn.map.channel_transaction_pending(dst),
            ),
            None => {
                log::error!("missing TURN state on relay entry");
                return Err(Error::ErrRelayEntryNotFound);
            }
        };

        if let Some(number) = bound {
            log::trace!(
                "sending datagram via channel 0x{:04X}, size={}",
                number,
                data.len()
            );
            let mut ch_data = ChannelData {
                data: data.to_vec(),
                number: ChannelNumber(number),
                ..Default::default()
            };
            ch_data.encode();

            let record = state.entries[id].record;
            return self.direct_send(&record, &ch_data.raw, ds);
        }

        // No usable channel yet: get a binding going, deliver through a
        // Send indication meanwhile.
        if !bind_in_flight {
            if let Err(err) = self.send_turn_channel_bind(state, id, dst, ds) {
                log::warn!("failed to send TURN ChannelBind request: {}", err);
            }
        }
        self.relay_send(state, id, dst, data, ds)
    }
}
