use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use stun::agent::TransactionId;
use stun::message::*;
use tokio::time::Duration;

use super::agent_config::*;
use super::agent_internal::*;
use crate::attributes::*;
use crate::candidate::*;
use crate::error::Result;
use crate::state::ConnectionState;

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn host(s: &str) -> Candidate {
    Candidate::new(CandidateType::Host, COMPONENT_DATA, addr(s))
}

#[tokio::test]
async fn test_arm_transmission_pacing() {
    let (internal, _events_rx) = AgentInternal::new(AgentConfig::default());

    let mut guard = internal.state.lock().await;
    let state = &mut *guard;
    for i in 0..4 {
        state.entries.push(StunEntry::new(
            EntryKind::Check,
            addr(&format!("10.0.0.{}:40000", i + 1)),
        ));
    }
    for i in 0..4 {
        internal.arm_transmission(state, i, Duration::from_secs(0));
    }

    for i in 0..4 {
        for j in 0..4 {
            if i == j {
                continue;
            }
            let a = state.entries[i].next_transmission.unwrap();
            let b = state.entries[j].next_transmission.unwrap();
            let gap = if a >= b {
                a.duration_since(b)
            } else {
                b.duration_since(a)
            };
            assert!(
                gap >= STUN_PACING_TIME,
                "entries {} and {} are only {:?} apart",
                i,
                j,
                gap
            );
        }
    }
}

#[tokio::test]
async fn test_selected_pair_follows_priority() -> Result<()> {
    let (internal, _events_rx) = AgentInternal::new(AgentConfig::default());
    internal
        .connection_state
        .store(ConnectionState::Connecting as u8, Ordering::SeqCst);

    let mut guard = internal.state.lock().await;
    let state = &mut *guard;
    state.mode = Role::Controlled;

    let high = state.remote.add_candidate(host("10.0.0.1:4000"))?;
    let low = state.remote.add_candidate(Candidate::new(
        CandidateType::Relay,
        COMPONENT_DATA,
        addr("10.0.0.2:4000"),
    ))?;
    internal.add_candidate_pair(state, None, high)?;
    internal.add_candidate_pair(state, None, low)?;

    state.pairs[0].state = CandidatePairState::Succeeded;
    state.pairs[1].state = CandidatePairState::Succeeded;
    internal.bookkeeping(state);

    // The host pair outranks the relayed pair.
    assert_eq!(state.selected_pair, Some(0));
    assert!(internal.selected_entry.load().is_some());

    // A nominated pair wins over a higher-priority succeeded one.
    state.pairs[1].nominated = true;
    internal.bookkeeping(state);
    assert_eq!(state.selected_pair, Some(1));

    Ok(())
}

#[tokio::test]
async fn test_nomination_completes_without_pending_pairs() -> Result<()> {
    let (internal, _events_rx) = AgentInternal::new(AgentConfig::default());
    internal
        .connection_state
        .store(ConnectionState::Connecting as u8, Ordering::SeqCst);

    let mut guard = internal.state.lock().await;
    let state = &mut *guard;
    state.mode = Role::Controlled;

    let remote = state.remote.add_candidate(host("10.0.0.1:4000"))?;
    internal.add_candidate_pair(state, None, remote)?;
    state.pairs[0].state = CandidatePairState::Succeeded;

    internal.bookkeeping(state);
    assert_eq!(internal.connection_state(), ConnectionState::Connected);

    state.pairs[0].nominated = true;
    internal.bookkeeping(state);
    assert_eq!(internal.connection_state(), ConnectionState::Completed);

    // The nominated entry keeps the binding alive.
    assert_eq!(state.entries[0].state, EntryState::SucceededKeepalive);

    Ok(())
}

#[tokio::test]
async fn test_retransmissions_clamped_once_selected() -> Result<()> {
    let (internal, _events_rx) = AgentInternal::new(AgentConfig::default());
    internal
        .connection_state
        .store(ConnectionState::Connecting as u8, Ordering::SeqCst);

    let mut guard = internal.state.lock().await;
    let state = &mut *guard;
    state.mode = Role::Controlling;

    let remote = state.remote.add_candidate(host("10.0.0.1:4000"))?;
    internal.add_candidate_pair(state, None, remote)?;
    state.pairs[0].state = CandidatePairState::Succeeded;
    state.pairs[0].nominated = true;
    state.pairs[0].nomination_requested = true;

    // A server entry still probing.
    let mut server = StunEntry::new(EntryKind::Server, addr("198.51.100.1:3478"));
    server.state = EntryState::Pending;
    server.retransmissions = 5;
    state.entries.push(server);

    internal.bookkeeping(state);
    assert_eq!(state.entries[1].retransmissions, 1);

    Ok(())
}

#[tokio::test]
async fn test_fail_deadline_without_pairs() {
    let config = AgentConfig {
        fail_timeout: Duration::from_millis(50),
        ..AgentConfig::default()
    };
    let (internal, _events_rx) = AgentInternal::new(config);
    internal
        .connection_state
        .store(ConnectionState::Connecting as u8, Ordering::SeqCst);

    {
        let mut guard = internal.state.lock().await;
        internal.bookkeeping(&mut guard);
        assert!(guard.fail_at.is_some());
        assert_ne!(internal.connection_state(), ConnectionState::Failed);
    }

    tokio::time::sleep(Duration::from_millis(60)).await;

    {
        let mut guard = internal.state.lock().await;
        internal.bookkeeping(&mut guard);
        assert_eq!(internal.connection_state(), ConnectionState::Failed);
    }
}

#[tokio::test]
async fn test_fail_deadline_immediate_once_remote_finished() {
    let (internal, _events_rx) = AgentInternal::new(AgentConfig::default());
    internal
        .connection_state
        .store(ConnectionState::Connecting as u8, Ordering::SeqCst);

    let mut guard = internal.state.lock().await;
    guard.remote.finished = true;
    internal.bookkeeping(&mut guard);
    assert_eq!(internal.connection_state(), ConnectionState::Failed);
}

#[tokio::test]
async fn test_remote_description_unfreezes_pairs() -> Result<()> {
    let (internal, _events_rx) = AgentInternal::new(AgentConfig::default());

    internal
        .add_remote_candidate("candidate:123456 1 udp 2130706431 10.0.0.1 4000 typ host")
        .await?;

    {
        let guard = internal.state.lock().await;
        assert_eq!(guard.pairs.len(), 1);
        // No remote credentials yet, so the pair stays frozen.
        assert_eq!(guard.pairs[0].state, CandidatePairState::Frozen);
        assert_eq!(guard.entries[0].state, EntryState::Idle);
    }

    internal
        .set_remote_description("a=ice-ufrag:remotefrag\na=ice-pwd:remotepwdremotepwdremotepwd\n")
        .await?;

    {
        let guard = internal.state.lock().await;
        assert_eq!(guard.pairs[0].state, CandidatePairState::Pending);
        assert_eq!(guard.entries[0].state, EntryState::Pending);
        assert!(guard.entries[0].next_transmission.is_some());
        assert_eq!(guard.mode, Role::Controlled);
    }

    Ok(())
}

#[tokio::test]
async fn test_role_conflict_switches_to_controlled() -> Result<()> {
    let (internal, _events_rx) = AgentInternal::new(AgentConfig::default());
    internal.tie_breaker.store(1, Ordering::SeqCst);

    let mut guard = internal.state.lock().await;
    let state = &mut *guard;
    state.mode = Role::Controlling;

    let remote = state.remote.add_candidate(host("10.0.0.1:4000"))?;
    internal.add_candidate_pair(state, None, remote)?;

    let mut msg = Message::new();
    msg.build(&[
        Box::new(BINDING_REQUEST),
        Box::new(TransactionId::new()),
        Box::new(AttrControlling(u64::MAX)),
    ])?;

    internal.process_stun_binding(state, &msg, 0, &addr("10.0.0.1:4000"), None);
    assert_eq!(state.mode, Role::Controlled);

    Ok(())
}

#[tokio::test]
async fn test_role_conflict_keeps_role_with_larger_tiebreaker() -> Result<()> {
    let (internal, _events_rx) = AgentInternal::new(AgentConfig::default());
    internal.tie_breaker.store(u64::MAX, Ordering::SeqCst);

    let mut guard = internal.state.lock().await;
    let state = &mut *guard;
    state.mode = Role::Controlling;

    let remote = state.remote.add_candidate(host("10.0.0.1:4000"))?;
    internal.add_candidate_pair(state, None, remote)?;

    let mut msg = Message::new();
    msg.build(&[
        Box::new(BINDING_REQUEST),
        Box::new(TransactionId::new()),
        Box::new(AttrControlling(42)),
    ])?;

    // The 487 it tries to send fails without a socket, the role decision is
    // what matters here.
    internal.process_stun_binding(state, &msg, 0, &addr("10.0.0.1:4000"), None);
    assert_eq!(state.mode, Role::Controlling);

    Ok(())
}

#[tokio::test]
async fn test_role_conflict_response_switches_and_rerolls() -> Result<()> {
    use stun::error_code::{ErrorCodeAttribute, CODE_ROLE_CONFLICT};

    let (internal, _events_rx) = AgentInternal::new(AgentConfig::default());
    internal.tie_breaker.store(7, Ordering::SeqCst);

    let mut guard = internal.state.lock().await;
    let state = &mut *guard;
    state.mode = Role::Controlling;

    let remote = state.remote.add_candidate(host("10.0.0.1:4000"))?;
    internal.add_candidate_pair(state, None, remote)?;
    state.entries[0].asserted_role = Role::Controlling;

    let mut msg = Message::new();
    msg.build(&[
        Box::new(MessageType::new(METHOD_BINDING, CLASS_ERROR_RESPONSE)),
        Box::new(TransactionId::new()),
        Box::new(ErrorCodeAttribute {
            code: CODE_ROLE_CONFLICT,
            reason: b"Role Conflict".to_vec(),
        }),
    ])?;

    internal.process_stun_binding(state, &msg, 0, &addr("10.0.0.1:4000"), None);

    assert_eq!(state.mode, Role::Controlled);
    assert_ne!(internal.tie_breaker.load(Ordering::SeqCst), 7);
    // The check is repeated immediately.
    assert_eq!(state.entries[0].state, EntryState::Pending);
    assert!(state.entries[0].next_transmission.is_some());

    // A stale 487 for the same assertion must not flip the role back.
    state.entries[0].asserted_role = Role::Controlling;
    internal.process_stun_binding(state, &msg, 0, &addr("10.0.0.1:4000"), None);
    assert_eq!(state.mode, Role::Controlled);

    Ok(())
}

#[tokio::test]
async fn test_relayed_local_pairs_carry_relay_entry() -> Result<()> {
    let (internal, _events_rx) = AgentInternal::new(AgentConfig::default());

    let mut guard = internal.state.lock().await;
    let state = &mut *guard;

    let relayed = addr("203.0.113.5:50000");
    let mut relay = StunEntry::new(EntryKind::Relay, addr("203.0.113.5:3478"));
    relay.relayed = Some(relayed);
    state.entries.push(relay);
    state
        .local
        .add_candidate(Candidate::new(CandidateType::Relay, COMPONENT_DATA, relayed))?;

    let remote = state.remote.add_candidate(host("198.51.100.7:4000"))?;
    internal.add_candidate_pairs_for_remote(state, remote)?;

    // One undifferentiated pair plus one relayed-local pair.
    assert_eq!(state.pairs.len(), 2);
    assert_eq!(state.pairs[0].local, None);
    assert_eq!(state.pairs[1].local, Some(0));

    let relayed_check = state
        .entries
        .iter()
        .find(|e| e.kind == EntryKind::Check && e.relay_entry.is_some())
        .expect("missing relayed check entry");
    assert_eq!(relayed_check.relay_entry, Some(0));

    Ok(())
}

#[tokio::test]
async fn test_ordered_pairs_by_priority() -> Result<()> {
    let (internal, _events_rx) = AgentInternal::new(AgentConfig::default());

    let mut guard = internal.state.lock().await;
    let state = &mut *guard;
    state.mode = Role::Controlling;

    let relay = state.remote.add_candidate(Candidate::new(
        CandidateType::Relay,
        COMPONENT_DATA,
        addr("10.0.0.1:4000"),
    ))?;
    let host_id = state.remote.add_candidate(host("10.0.0.2:4000"))?;
    internal.add_candidate_pair(state, None, relay)?;
    internal.add_candidate_pair(state, None, host_id)?;

    let priorities: Vec<u64> = state
        .ordered_pairs
        .iter()
        .map(|&pid| state.pairs[pid].priority)
        .collect();
    let mut sorted = priorities.clone();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    assert_eq!(priorities, sorted);
    // The host pair comes first.
    assert_eq!(state.ordered_pairs[0], 1);

    Ok(())
}
