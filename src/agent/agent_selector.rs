use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use stun::attributes::*;
use stun::error_code::*;
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::*;
use stun::textattrs::{TextAttribute, Username};
use stun::xoraddr::XorMappedAddress;
use tokio::time::Duration;

use super::agent_internal::*;
use crate::attributes::*;
use crate::candidate::*;
use crate::error::*;

impl AgentInternal {
    /// Verifies an inbound Binding request or success response from the
    /// peer: username shape, ufrag ownership and short-term integrity.
    pub(crate) fn verify_stun_binding(
        &self,
        state: &AgentState,
        msg: &mut Message,
        src: &SocketAddr,
    ) -> Result<()> {
        if msg.typ.class == CLASS_INDICATION || msg.typ.class == CLASS_ERROR_RESPONSE {
            return Ok(());
        }

        // The USERNAME attribute is not present in responses.
        if msg.typ.class == CLASS_REQUEST {
            let username = TextAttribute::get_from_as(msg, ATTR_USERNAME)?.text;
            let mut parts = username.splitn(2, ':');
            let local_ufrag = parts.next().unwrap_or_default();
            let remote_ufrag = parts.next().ok_or_else(|| {
                Error::Other(format!("invalid STUN username \"{}\"", username))
            })?;

            if local_ufrag != state.local.ufrag {
                return Err(Error::Other(format!(
                    "local ufrag check failed from {}, expected \"{}\", actual \"{}\"",
                    src, state.local.ufrag, local_ufrag
                )));
            }
            // RFC 8445 7.3: a Binding request may well arrive before the
            // remote candidates, in which case the remote ufrag is still
            // unknown and cannot be checked.
            if !state.remote.ufrag.is_empty() && remote_ufrag != state.remote.ufrag {
                return Err(Error::Other(format!(
                    "remote ufrag check failed from {}, expected \"{}\", actual \"{}\"",
                    src, state.remote.ufrag, remote_ufrag
                )));
            }
        }

        // RFC 8445 7.2.2: requests are keyed with our password, responses
        // with the peer's.
        let pwd = if msg.typ.class == CLASS_REQUEST {
            &state.local.pwd
        } else {
            &state.remote.pwd
        };
        if pwd.is_empty() {
            return Err(Error::Other("integrity check failed, unknown password".to_owned()));
        }
        MessageIntegrity::new_short_term_integrity(pwd.clone()).check(msg)?;
        Ok(())
    }

    /// Sends a connectivity check or a server Binding request on an entry.
    pub(crate) fn send_binding_request(&self, state: &mut AgentState, id: EntryId) -> Result<()> {
        log::debug!("sending STUN Binding request");

        let mut msg = Message::new();
        if state.entries[id].kind == EntryKind::Check {
            // RFC 8445 7.2.2. Forming Credentials: short-term credentials,
            // username {remote_ufrag}:{local_ufrag}, keyed with the peer's
            // password.
            if state.remote.ufrag.is_empty() || state.remote.pwd.is_empty() {
                log::error!("attempted to send a check without remote ICE credentials");
                return Err(Error::ErrMissingRemoteCredentials);
            }

            let username = format!("{}:{}", state.remote.ufrag, state.local.ufrag);
            state.entries[id].asserted_role = state.mode;
            let nomination_requested = state.entries[id]
                .pair
                .map(|pid| state.pairs[pid].nomination_requested)
                .unwrap_or(false);

            let mut setters: Vec<Box<dyn Setter>> = vec![
                Box::new(BINDING_REQUEST),
                Box::new(state.entries[id].transaction_id),
                Box::new(Username::new(ATTR_USERNAME, username)),
            ];
            match state.mode {
                Role::Controlling => {
                    setters.push(Box::new(AttrControlling(
                        self.tie_breaker.load(Ordering::SeqCst),
                    )));
                }
                Role::Controlled => {
                    setters.push(Box::new(AttrControlled(
                        self.tie_breaker.load(Ordering::SeqCst),
                    )));
                }
                Role::Unspecified => {}
            }
            // RFC 8445 7.1.1: PRIORITY uses the peer-reflexive type
            // preference.
            setters.push(Box::new(PriorityAttr(compute_priority(
                CandidateType::PeerReflexive,
                COMPONENT_DATA,
            ))));
            // RFC 8445 8.1.1: repeat the successful check with
            // USE-CANDIDATE to nominate (controlling only).
            if state.mode == Role::Controlling && nomination_requested {
                setters.push(Box::new(UseCandidateAttr::new()));
            }
            setters.push(Box::new(MessageIntegrity::new_short_term_integrity(
                state.remote.pwd.clone(),
            )));
            setters.push(Box::new(FINGERPRINT));

            msg.build(&setters)?;
        } else {
            msg.build(&[
                Box::new(BINDING_REQUEST),
                Box::new(state.entries[id].transaction_id),
                Box::new(FINGERPRINT),
            ])?;
        }

        self.send_entry_message(state, id, &msg)
    }

    /// RFC 8445 11. Keepalives: a Binding indication with no authentication
    /// and no attributes other than FINGERPRINT.
    pub(crate) fn send_binding_indication(&self, state: &mut AgentState, id: EntryId) -> Result<()> {
        log::debug!("sending STUN Binding indication");

        let mut msg = Message::new();
        msg.build(&[
            Box::new(MessageType::new(METHOD_BINDING, CLASS_INDICATION)),
            Box::new(stun::agent::TransactionId::new()),
            Box::new(FINGERPRINT),
        ])?;

        self.send_entry_message(state, id, &msg)
    }

    fn send_binding_success(
        &self,
        state: &mut AgentState,
        id: EntryId,
        transaction_id: stun::agent::TransactionId,
        mapped: SocketAddr,
    ) -> Result<()> {
        log::debug!("sending STUN Binding success response");

        let mut msg = Message::new();
        msg.build(&[
            Box::new(BINDING_SUCCESS),
            Box::new(transaction_id),
            Box::new(XorMappedAddress {
                ip: mapped.ip(),
                port: mapped.port(),
            }),
            Box::new(MessageIntegrity::new_short_term_integrity(
                state.local.pwd.clone(),
            )),
            Box::new(FINGERPRINT),
        ])?;

        self.send_entry_message(state, id, &msg)
    }

    fn send_binding_error(
        &self,
        state: &mut AgentState,
        id: EntryId,
        transaction_id: stun::agent::TransactionId,
        code: ErrorCode,
        reason: &str,
    ) -> Result<()> {
        log::debug!("sending STUN Binding error response, code={}", code.0);

        let mut msg = Message::new();
        msg.build(&[
            Box::new(MessageType::new(METHOD_BINDING, CLASS_ERROR_RESPONSE)),
            Box::new(transaction_id),
            Box::new(ErrorCodeAttribute {
                code,
                reason: reason.as_bytes().to_vec(),
            }),
            Box::new(MessageIntegrity::new_short_term_integrity(
                state.local.pwd.clone(),
            )),
            Box::new(FINGERPRINT),
        ])?;

        self.send_entry_message(state, id, &msg)
    }

    /// Routes an outbound STUN message through the entry's relay when its
    /// local candidate is relayed, directly otherwise.
    pub(crate) fn send_entry_message(
        &self,
        state: &mut AgentState,
        id: EntryId,
        msg: &Message,
    ) -> Result<()> {
        let record = state.entries[id].record;
        match state.entries[id].relay_entry {
            Some(relay_entry) => {
                log::debug!("sending STUN message via relay");
                self.relay_send(state, relay_entry, &record, &msg.raw, None)
            }
            None => self.direct_send(&record, &msg.raw, None),
        }
    }

    pub(crate) fn process_stun_binding(
        &self,
        state: &mut AgentState,
        msg: &Message,
        id: EntryId,
        src: &SocketAddr,
        relayed: Option<&SocketAddr>,
    ) {
        match msg.typ.class {
            CLASS_REQUEST => self.process_binding_request(state, msg, id, src),
            CLASS_SUCCESS_RESPONSE => self.process_binding_success(state, msg, id, relayed),
            CLASS_ERROR_RESPONSE => self.process_binding_error(state, msg, id),
            CLASS_INDICATION => {
                log::trace!("received STUN Binding indication");
            }
            class => {
                log::warn!("got unexpected STUN Binding message, class={}", class);
            }
        }
    }

    fn process_binding_request(
        &self,
        state: &mut AgentState,
        msg: &Message,
        id: EntryId,
        src: &SocketAddr,
    ) {
        log::debug!("received STUN Binding request");
        if state.entries[id].kind != EntryKind::Check {
            return;
        }
        let pair_id = match state.entries[id].pair {
            Some(pair_id) => pair_id,
            None => return,
        };

        let has_controlling = msg.contains(ATTR_ICE_CONTROLLING);
        let has_controlled = msg.contains(ATTR_ICE_CONTROLLED);
        if has_controlling == has_controlled {
            // A full agent asserts exactly one role per request.
            let _ = self.send_binding_error(
                state,
                id,
                msg.transaction_id,
                CODE_BAD_REQUEST,
                "Bad Request",
            );
            return;
        }

        // RFC 8445 7.3.1.1. Detecting and Repairing Role Conflicts: the
        // side holding the larger tiebreaker keeps its role and answers
        // 487, the other switches.
        if state.mode == Role::Controlling && has_controlling {
            log::warn!("ICE role conflict (both controlling)");
            let mut attr = AttrControlling::default();
            let _ = attr.get_from(msg);
            if self.tie_breaker.load(Ordering::SeqCst) >= attr.0 {
                log::debug!("asking remote peer to switch roles");
                let _ = self.send_binding_error(
                    state,
                    id,
                    msg.transaction_id,
                    CODE_ROLE_CONFLICT,
                    "Role Conflict",
                );
            } else {
                log::debug!("switching to controlled role");
                state.mode = Role::Controlled;
                self.update_candidate_pairs(state);
            }
            return;
        }
        if state.mode == Role::Controlled && has_controlled {
            log::warn!("ICE role conflict (both controlled)");
            let mut attr = AttrControlled::default();
            let _ = attr.get_from(msg);
            if self.tie_breaker.load(Ordering::SeqCst) >= attr.0 {
                log::debug!("switching to controlling role");
                state.mode = Role::Controlling;
                self.update_candidate_pairs(state);
            } else {
                log::debug!("asking remote peer to switch roles");
                let _ = self.send_binding_error(
                    state,
                    id,
                    msg.transaction_id,
                    CODE_ROLE_CONFLICT,
                    "Role Conflict",
                );
            }
            return;
        }

        if UseCandidateAttr::is_set(msg) {
            if !has_controlling {
                log::warn!("USE-CANDIDATE without ICE-CONTROLLING attribute");
                let _ = self.send_binding_error(
                    state,
                    id,
                    msg.transaction_id,
                    CODE_BAD_REQUEST,
                    "Bad Request",
                );
                return;
            }
            // RFC 8445 7.3.1.5. Updating the Nominated Flag: a Succeeded
            // pair is nominated right away; otherwise remember the request
            // and let the triggered check confirm it.
            if state.pairs[pair_id].state == CandidatePairState::Succeeded {
                log::debug!("got a nominated pair (controlled)");
                state.pairs[pair_id].nominated = true;
            } else if !state.pairs[pair_id].nomination_requested {
                state.pairs[pair_id].nomination_requested = true;
                state.pairs[pair_id].state = CandidatePairState::Pending;
                state.entries[id].state = EntryState::Pending;
                // Transmit after the response.
                self.arm_transmission(state, id, STUN_PACING_TIME);
            }
        }

        if self
            .send_binding_success(state, id, msg.transaction_id, *src)
            .is_err()
        {
            log::error!("failed to send STUN Binding response");
        }
    }

    fn process_binding_success(
        &self,
        state: &mut AgentState,
        msg: &Message,
        id: EntryId,
        relayed: Option<&SocketAddr>,
    ) {
        log::debug!(
            "received STUN Binding success response from {}",
            if state.entries[id].kind == EntryKind::Check {
                "peer"
            } else {
                "server"
            }
        );

        if state.entries[id].kind == EntryKind::Server {
            log::info!("STUN server binding successful");
        }

        if state.entries[id].state != EntryState::SucceededKeepalive {
            state.entries[id].state = EntryState::Succeeded;
            state.entries[id].next_transmission = None;
        }

        let selected_nominated = state
            .selected_pair
            .map(|pid| state.pairs[pid].nominated)
            .unwrap_or(false);
        if !selected_nominated {
            // Keepalives are wanted right away.
            state.entries[id].state = EntryState::SucceededKeepalive;
            self.arm_transmission(state, id, self.config.keepalive_interval);
        }

        let mut mapped = None;
        let mut xor_addr = XorMappedAddress::default();
        if xor_addr.get_from(msg).is_ok() {
            mapped = Some(canonical_addr(SocketAddr::new(xor_addr.ip, xor_addr.port)));
        }

        if let (Some(mapped), None) = (mapped, relayed) {
            log::trace!("response has mapped address {}", mapped);
            let kind = if state.entries[id].kind == EntryKind::Check {
                CandidateType::PeerReflexive
            } else {
                CandidateType::ServerReflexive
            };
            self.add_local_reflexive_candidate(state, kind, mapped);
        }

        if state.entries[id].kind == EntryKind::Check {
            let pair_id = match state.entries[id].pair {
                Some(pair_id) => pair_id,
                None => return,
            };

            if state.pairs[pair_id].state != CandidatePairState::Succeeded {
                log::debug!("pair check succeeded");
                state.pairs[pair_id].state = CandidatePairState::Succeeded;
            }

            // Resolve the concrete local side from the mapped address.
            if state.pairs[pair_id].local.is_none() {
                if let Some(mapped) = mapped {
                    state.pairs[pair_id].local = state
                        .local
                        .find_candidate_from_addr(&mapped, CandidateType::Unspecified);
                }
            }

            // RFC 8445 7.3.1.5: the successful re-check carrying
            // USE-CANDIDATE turns the nomination request into a nomination.
            if state.pairs[pair_id].nomination_requested {
                log::debug!("got a nominated pair ({})", state.mode);
                state.pairs[pair_id].nominated = true;
            }
        } else if state.entries[id].kind == EntryKind::Server {
            self.update_gathering_done(state);
        }
    }

    fn process_binding_error(&self, state: &mut AgentState, msg: &Message, id: EntryId) {
        let mut code = ErrorCodeAttribute::default();
        let _ = code.get_from(msg);
        log::warn!("got STUN Binding error response, code={}", code.code.0);

        if state.entries[id].kind == EntryKind::Check && code.code == CODE_ROLE_CONFLICT {
            // RFC 8445 7.2.5.1. Role Conflict: switch away from the role the
            // check asserted, change the tiebreaker and repeat the check.
            // The switch only applies while the current role still matches;
            // an inbound request may already have repaired the conflict.
            let asserted = state.entries[id].asserted_role;
            if asserted != Role::Unspecified && asserted == state.mode {
                let new_mode = match state.mode {
                    Role::Controlling => Role::Controlled,
                    Role::Controlled => Role::Controlling,
                    Role::Unspecified => Role::Unspecified,
                };
                log::warn!("ICE role conflict");
                log::debug!("switching roles to {} as requested", new_mode);
                state.mode = new_mode;
                self.update_candidate_pairs(state);
            }

            self.tie_breaker.store(rand::random::<u64>(), Ordering::SeqCst);

            state.entries[id].state = EntryState::Pending;
            self.arm_transmission(state, id, Duration::from_secs(0));
        } else {
            log::info!("STUN binding failed");
            state.entries[id].state = EntryState::Failed;
            if let Some(pair_id) = state.entries[id].pair {
                state.pairs[pair_id].state = CandidatePairState::Failed;
            }
            self.update_gathering_done(state);
        }
    }
}
