use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use stun::agent::TransactionId;
use stun::message::*;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use util::sync::Mutex as SyncMutex;

use super::agent_config::*;
use super::OnCandidateHdlrFn;
use super::OnConnectionStateChangeHdlrFn;
use super::OnDataHdlrFn;
use crate::attributes::Role;
use crate::candidate::*;
use crate::description::*;
use crate::error::*;
use crate::state::*;

pub(crate) const RECEIVE_MTU: usize = 8192;

/// RFC 8445: agents SHOULD use a Ta value of 50 ms.
pub(crate) const STUN_PACING_TIME: Duration = Duration::from_millis(50);

pub(crate) const MIN_STUN_RETRANSMISSION_TIMEOUT: Duration = Duration::from_millis(250);
pub(crate) const MAX_STUN_RETRANSMISSION_COUNT: u32 = 7;

pub(crate) const STUN_KEEPALIVE_PERIOD: Duration = Duration::from_secs(15);

/// Lifetime requested in Allocate and Refresh.
pub(crate) const TURN_LIFETIME: Duration = Duration::from_secs(600);
pub(crate) const TURN_REFRESH_PERIOD: Duration = Duration::from_secs(300);

/// Grace period for further remote candidates once every pair failed.
pub(crate) const ICE_FAIL_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) const MAX_CANDIDATE_PAIRS_COUNT: usize = 16;
pub(crate) const MAX_RELAY_ENTRIES_COUNT: usize = 2;
pub(crate) const MAX_SERVER_ENTRIES_COUNT: usize = 2;
pub(crate) const MAX_STUN_ENTRIES_COUNT: usize =
    MAX_CANDIDATE_PAIRS_COUNT + MAX_RELAY_ENTRIES_COUNT + MAX_SERVER_ENTRIES_COUNT;
pub(crate) const MAX_RESOLVER_RECORDS_COUNT: usize = 8;

/// Indexes a STUN entry inside the agent.
pub(crate) type EntryId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EntryKind {
    /// Connectivity check against a remote candidate.
    Check,
    /// Binding against a STUN server for reflexive discovery.
    Server,
    /// Allocation on a TURN server.
    Relay,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EntryState {
    Idle,
    Pending,
    Cancelled,
    Failed,
    Succeeded,
    /// Succeeded and keeping the binding alive periodically.
    SucceededKeepalive,
}

/// One outstanding transactional relationship on the shared socket.
///
/// Entries are append-only; terminal states leave the slot in place so
/// `EntryId` references stay valid.
pub(crate) struct StunEntry {
    pub(crate) kind: EntryKind,
    pub(crate) state: EntryState,
    /// Destination of requests for this entry.
    pub(crate) record: SocketAddr,
    pub(crate) pair: Option<PairId>,
    /// For Check entries whose local candidate is relayed: the Relay entry
    /// carrying the allocation.
    pub(crate) relay_entry: Option<EntryId>,
    /// For Relay entries: the allocated relayed transport address.
    pub(crate) relayed: Option<SocketAddr>,
    pub(crate) transaction_id: TransactionId,
    /// Role asserted by the last request sent on this entry, to decide
    /// whether a 487 still applies.
    pub(crate) asserted_role: Role,
    pub(crate) retransmissions: i64,
    pub(crate) retransmission_timeout: Duration,
    pub(crate) next_transmission: Option<Instant>,
    /// Cleared by the send path so bookkeeping reschedules the keepalive.
    pub(crate) armed: Arc<AtomicBool>,
    pub(crate) turn: Option<crate::relay::TurnState>,
}

impl StunEntry {
    pub(crate) fn new(kind: EntryKind, record: SocketAddr) -> Self {
        Self {
            kind,
            state: EntryState::Idle,
            record,
            pair: None,
            relay_entry: None,
            relayed: None,
            transaction_id: TransactionId::new(),
            asserted_role: Role::Unspecified,
            retransmissions: 0,
            retransmission_timeout: MIN_STUN_RETRANSMISSION_TIMEOUT,
            next_transmission: None,
            armed: Arc::new(AtomicBool::new(false)),
            turn: None,
        }
    }
}

/// Lock-free snapshot of the entry behind the selected pair, consulted by
/// the hot send path.
pub(crate) struct SelectedEntry {
    pub(crate) entry: EntryId,
    pub(crate) record: SocketAddr,
    pub(crate) relay_entry: Option<EntryId>,
    pub(crate) armed: Arc<AtomicBool>,
}

pub(crate) enum AgentEvent {
    StateChange(ConnectionState),
    Candidate(Candidate),
    GatheringDone,
    Data(Vec<u8>),
}

/// Mutable agent state, guarded by the agent mutex. The worker releases the
/// mutex only around its select point.
pub(crate) struct AgentState {
    pub(crate) local: LocalDescription,
    pub(crate) remote: RemoteDescription,
    pub(crate) entries: Vec<StunEntry>,
    pub(crate) pairs: Vec<CandidatePair>,
    /// Pair ids ordered by descending pair priority.
    pub(crate) ordered_pairs: Vec<PairId>,
    pub(crate) mode: Role,
    pub(crate) selected_pair: Option<PairId>,
    pub(crate) gathering_done: bool,
    pub(crate) fail_at: Option<Instant>,
}

pub struct AgentInternal {
    pub(crate) config: AgentConfig,

    pub(crate) state: Mutex<AgentState>,
    pub(crate) socket: ArcSwapOption<UdpSocket>,
    /// Serializes the Differentiated Services setsockopt with sends.
    /// Holds the last applied DSCP value, -1 once disabled.
    pub(crate) send_ds: SyncMutex<i64>,

    pub(crate) connection_state: AtomicU8,
    pub(crate) tie_breaker: AtomicU64,
    pub(crate) selected_entry: ArcSwapOption<SelectedEntry>,

    /// Wakes the worker out of its select whenever state changed.
    pub(crate) interrupt: Notify,
    pub(crate) stopped: AtomicBool,
    pub(crate) worker_handle: Mutex<Option<JoinHandle<()>>>,

    pub(crate) events_tx: mpsc::Sender<AgentEvent>,
    pub(crate) on_connection_state_change_hdlr:
        ArcSwapOption<Mutex<OnConnectionStateChangeHdlrFn>>,
    pub(crate) on_candidate_hdlr: ArcSwapOption<Mutex<OnCandidateHdlrFn>>,
    pub(crate) on_data_hdlr: ArcSwapOption<Mutex<OnDataHdlrFn>>,
}

impl AgentInternal {
    pub(crate) fn new(config: AgentConfig) -> (Self, mpsc::Receiver<AgentEvent>) {
        let (events_tx, events_rx) = mpsc::channel(512);

        let internal = Self {
            config,
            state: Mutex::new(AgentState {
                local: LocalDescription::new_local(),
                remote: RemoteDescription::default(),
                entries: vec![],
                pairs: vec![],
                ordered_pairs: vec![],
                mode: Role::Unspecified,
                selected_pair: None,
                gathering_done: false,
                fail_at: None,
            }),
            socket: ArcSwapOption::empty(),
            send_ds: SyncMutex::new(0),

            connection_state: AtomicU8::new(ConnectionState::Disconnected as u8),
            // RFC 8445 16.1: a 64-bit random tiebreaker, changed on 487.
            tie_breaker: AtomicU64::new(rand::random::<u64>()),
            selected_entry: ArcSwapOption::empty(),

            interrupt: Notify::new(),
            stopped: AtomicBool::new(false),
            worker_handle: Mutex::new(None),

            events_tx,
            on_connection_state_change_hdlr: ArcSwapOption::empty(),
            on_candidate_hdlr: ArcSwapOption::empty(),
            on_data_hdlr: ArcSwapOption::empty(),
        };

        (internal, events_rx)
    }

    pub(crate) fn emit(&self, event: AgentEvent) {
        if self.events_tx.try_send(event).is_err() {
            log::warn!("event queue full, dropping event");
        }
    }

    pub(crate) fn connection_state(&self) -> ConnectionState {
        ConnectionState::from(self.connection_state.load(Ordering::SeqCst))
    }

    pub(crate) fn change_state(&self, new_state: ConnectionState) {
        if self.connection_state() != new_state {
            log::info!("changing state to {}", new_state);
            self.connection_state
                .store(new_state as u8, Ordering::SeqCst);
            self.emit(AgentEvent::StateChange(new_state));
        }
    }

    pub(crate) fn interrupt(&self) {
        self.interrupt.notify_one();
    }

    pub(crate) async fn close(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Err(Error::ErrClosed);
        }
        self.interrupt();

        let handle = { self.worker_handle.lock().await.take() };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.selected_entry.store(None);
        Ok(())
    }

    /// Lock-free fast path: reads the published selected entry, disarms its
    /// keepalive and sends directly, or routes through the relay channel.
    pub(crate) async fn send(&self, data: &[u8], ds: Option<u32>) -> Result<()> {
        let selected = match self.selected_entry.load_full() {
            Some(selected) => selected,
            None => {
                log::error!("send called before ICE is connected");
                return Err(Error::ErrNotConnected);
            }
        };
        // Keepalive gets rescheduled by the next bookkeeping pass.
        selected.armed.store(false, Ordering::SeqCst);

        if let Some(relay_entry) = selected.relay_entry {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            self.channel_send(state, relay_entry, &selected.record, data, ds)
        } else {
            self.direct_send(&selected.record, data, ds)
        }
    }

    /// Sends one datagram on the shared socket, mapping the destination to
    /// the socket family and applying DSCP changes under the send lock.
    pub(crate) fn direct_send(&self, dst: &SocketAddr, buf: &[u8], ds: Option<u32>) -> Result<()> {
        let socket = self.socket.load_full().ok_or(Error::ErrClosed)?;
        let target = map_destination(&socket, *dst)?;

        let mut send_ds = self.send_ds.lock();
        if let Some(ds) = ds {
            if *send_ds >= 0 && *send_ds != i64::from(ds) {
                log::debug!("setting Differentiated Services field to 0x{:x}", ds);
                let raw = socket2::SockRef::from(socket.as_ref());
                if raw.set_tos(ds).is_ok() {
                    *send_ds = i64::from(ds);
                } else {
                    // Disable for next time.
                    *send_ds = -1;
                }
            }
        }

        log::trace!("sending datagram, size={}", buf.len());
        match socket.try_send_to(buf, target) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                log::trace!("socket busy, datagram dropped");
                Ok(())
            }
            Err(err) => {
                log::warn!("send failed: {}", err);
                Err(err.into())
            }
        }
    }

    /// Worker: resolves the configured servers, then drives bookkeeping and
    /// the shared socket until stopped or failed.
    pub(crate) async fn run(self: Arc<Self>) {
        self.change_state(ConnectionState::Connecting);

        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            self.register_turn_servers(state).await;
            self.register_stun_server(state).await;
            self.update_gathering_done(state);
        }

        let socket = match self.socket.load_full() {
            Some(socket) => socket,
            None => return,
        };

        let mut buf = vec![0u8; RECEIVE_MTU];
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }

            let next_timestamp = {
                let mut guard = self.state.lock().await;
                self.bookkeeping(&mut guard)
            };

            tokio::select! {
                _ = tokio::time::sleep_until(next_timestamp) => {}
                _ = self.interrupt.notified() => {}
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((n, src)) => {
                            let mut guard = self.state.lock().await;
                            let state = &mut *guard;
                            if n > 0 {
                                let src = canonical_addr(src);
                                self.input(state, &buf[..n], src, None);
                            }
                            // Drain whatever else is queued on the socket.
                            if !self.drain_socket(state, &socket, &mut buf) {
                                break;
                            }
                        }
                        Err(err) if is_transient_recv_error(&err) => {
                            // ICMP unreachable surfaced on the socket, the
                            // datagram is lost but the socket is fine.
                            log::debug!("ignoring {} returned by recv_from", err);
                            continue;
                        }
                        Err(err) => {
                            log::error!("recv_from failed: {}", err);
                            self.change_state(ConnectionState::Failed);
                            break;
                        }
                    }
                }
            }
        }

        log::debug!("leaving agent worker");
        if self.stopped.load(Ordering::SeqCst) {
            self.change_state(ConnectionState::Disconnected);
        }
    }

    fn drain_socket(
        &self,
        state: &mut AgentState,
        socket: &UdpSocket,
        buf: &mut [u8],
    ) -> bool {
        loop {
            match socket.try_recv_from(buf) {
                Ok((0, _)) => continue,
                Ok((n, src)) => {
                    let src = canonical_addr(src);
                    self.input(state, &buf[..n], src, None);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return true,
                Err(err) if is_transient_recv_error(&err) => {
                    log::debug!("ignoring {} returned by recv_from", err);
                    continue;
                }
                Err(err) => {
                    log::error!("recv_from failed: {}", err);
                    self.change_state(ConnectionState::Failed);
                    return false;
                }
            }
        }
    }

    /// One bookkeeping pass: retransmissions, keepalives, pair scheduling
    /// and state transitions. Returns the next wakeup deadline.
    pub(crate) fn bookkeeping(&self, state: &mut AgentState) -> Instant {
        let now = Instant::now();
        // Baseline horizon so keepalive rearm requests are noticed.
        let mut next_timestamp = now + Duration::from_secs(10);

        if self.connection_state() == ConnectionState::Disconnected {
            return next_timestamp;
        }

        for i in 0..state.entries.len() {
            match state.entries[i].state {
                EntryState::Pending => {
                    let due = state.entries[i]
                        .next_transmission
                        .map(|t| t <= now)
                        .unwrap_or(false);
                    if !due {
                        continue;
                    }

                    if state.entries[i].retransmissions > 0 {
                        log::debug!(
                            "STUN entry {}: sending request ({} transmissions left)",
                            i,
                            state.entries[i].retransmissions
                        );

                        let sent = if state.entries[i].kind == EntryKind::Relay {
                            self.send_turn_allocate_request(state, i, METHOD_ALLOCATE)
                        } else {
                            self.send_binding_request(state, i)
                        };

                        if sent.is_ok() {
                            let entry = &mut state.entries[i];
                            entry.retransmissions -= 1;
                            entry.next_transmission = Some(now + entry.retransmission_timeout);
                            entry.retransmission_timeout *= 2;
                            continue;
                        }
                    }

                    // Failure sending or end of retransmissions.
                    log::debug!("STUN entry {}: failed", i);
                    state.entries[i].state = EntryState::Failed;
                    state.entries[i].next_transmission = None;
                    if let Some(pid) = state.entries[i].pair {
                        state.pairs[pid].state = CandidatePairState::Failed;
                    }
                    match state.entries[i].kind {
                        EntryKind::Relay => {
                            log::info!("TURN allocation failed");
                            self.update_gathering_done(state);
                        }
                        EntryKind::Server => {
                            log::info!("STUN binding failed");
                            self.update_gathering_done(state);
                        }
                        EntryKind::Check => {}
                    }
                }
                EntryState::SucceededKeepalive => {
                    // RFC 8445 11. Keepalives: all endpoints MUST send
                    // keepalives for each data session.
                    let must_arm = !state.entries[i].armed.swap(true, Ordering::SeqCst);
                    if must_arm {
                        log::trace!("STUN entry {}: must be rearmed", i);
                        self.arm_transmission(state, i, self.config.keepalive_interval);
                    }

                    let due = state.entries[i]
                        .next_transmission
                        .map(|t| t <= now)
                        .unwrap_or(false);
                    if !due {
                        continue;
                    }

                    log::debug!("STUN entry {}: sending keepalive", i);
                    let sent = if state.entries[i].kind == EntryKind::Relay {
                        self.send_turn_allocate_request(state, i, METHOD_REFRESH)
                    } else {
                        self.send_binding_indication(state, i)
                    };
                    if sent.is_err() {
                        log::error!("sending keepalive failed");
                        continue;
                    }

                    self.arm_transmission(state, i, self.config.keepalive_interval);
                }
                _ => {
                    // Entry does not transmit.
                    state.entries[i].next_transmission = None;
                }
            }
        }

        let mut pending_count = 0usize;
        let mut nominated_pair: Option<PairId> = None;
        let mut selected_pair: Option<PairId> = None;

        if !state.pairs.is_empty() {
            for idx in 0..state.ordered_pairs.len() {
                let pid = state.ordered_pairs[idx];
                let pair = &mut state.pairs[pid];
                if pair.nominated {
                    if nominated_pair.is_none() {
                        nominated_pair = Some(pid);
                        selected_pair = Some(pid);
                    }
                } else if pair.state == CandidatePairState::Succeeded {
                    if selected_pair.is_none() {
                        selected_pair = Some(pid);
                    }
                } else if pair.state == CandidatePairState::Pending {
                    if state.mode == Role::Controlling && selected_pair.is_some() {
                        // A higher-priority pair will be used, stop checking.
                        log::trace!("cancelling check for lower-priority pair");
                        pair.state = CandidatePairState::Frozen;
                    } else {
                        pending_count += 1;
                    }
                }
            }

            // Cancel entries of frozen pairs.
            for i in 0..state.entries.len() {
                let frozen = state.entries[i]
                    .pair
                    .map(|pid| state.pairs[pid].state == CandidatePairState::Frozen)
                    .unwrap_or(false);
                if frozen
                    && state.entries[i].state != EntryState::Idle
                    && state.entries[i].state != EntryState::Cancelled
                {
                    log::debug!("STUN entry {}: cancelled", i);
                    state.entries[i].state = EntryState::Cancelled;
                    state.entries[i].next_transmission = None;
                }
            }

            if let Some(selected) = selected_pair {
                if state.selected_pair != Some(selected) {
                    log::debug!(
                        "new selected{} pair",
                        if state.pairs[selected].nominated {
                            " and nominated"
                        } else {
                            ""
                        }
                    );
                    state.selected_pair = Some(selected);
                    self.publish_selected_entry(state, selected);
                }

                if state.pairs[selected].nominated || state.mode == Role::Controlling {
                    // Limit retransmissions of still pending entries.
                    for entry in &mut state.entries {
                        if entry.state == EntryState::Pending && entry.retransmissions > 1 {
                            entry.retransmissions = 1;
                        }
                    }
                }

                if let Some(nominated) = nominated_pair {
                    // Direct transition from connecting to completed is not
                    // allowed.
                    if self.connection_state() == ConnectionState::Connecting {
                        self.change_state(ConnectionState::Connected);
                    }
                    if state.mode == Role::Controlled || pending_count == 0 {
                        self.change_state(ConnectionState::Completed);
                    }

                    // Keepalive only on the entry of the nominated pair.
                    let mut relay_entry = None;
                    for i in 0..state.entries.len() {
                        if state.entries[i].pair == Some(nominated) {
                            relay_entry = state.entries[i].relay_entry;
                            if state.entries[i].state != EntryState::SucceededKeepalive {
                                state.entries[i].state = EntryState::SucceededKeepalive;
                                self.arm_transmission(state, i, self.config.keepalive_interval);
                            }
                        } else if state.entries[i].state == EntryState::SucceededKeepalive {
                            state.entries[i].state = EntryState::Succeeded;
                        }
                    }

                    // A locally relayed nominated pair needs its TURN
                    // session refreshed as well.
                    if let Some(relay) = relay_entry {
                        if state.entries[relay].state != EntryState::SucceededKeepalive {
                            state.entries[relay].state = EntryState::SucceededKeepalive;
                            self.arm_transmission(state, relay, TURN_REFRESH_PERIOD);
                        }
                    }
                } else {
                    self.change_state(ConnectionState::Connected);

                    if state.mode == Role::Controlling && !state.pairs[selected].nomination_requested
                    {
                        // Repeat the check that succeeded, this time with
                        // USE-CANDIDATE.
                        log::debug!("requesting pair nomination (controlling)");
                        state.pairs[selected].nomination_requested = true;
                        for i in 0..state.entries.len() {
                            if state.entries[i].pair == Some(selected) {
                                // No keepalives until the nomination lands.
                                state.entries[i].state = EntryState::Pending;
                                self.arm_transmission(state, i, Duration::from_secs(0));
                                break;
                            }
                        }
                    }
                }
            }
        }

        if selected_pair.is_some() || pending_count > 0 {
            // Something can still succeed, no fail deadline.
            state.fail_at = None;
        } else {
            if state.fail_at.is_none() {
                let grace = if state.remote.finished {
                    Duration::from_secs(0)
                } else {
                    self.config.fail_timeout
                };
                state.fail_at = Some(now + grace);
            }
            if let Some(fail_at) = state.fail_at {
                if now >= fail_at {
                    self.change_state(ConnectionState::Failed);
                } else if next_timestamp > fail_at {
                    next_timestamp = fail_at;
                }
            }
        }

        for entry in &state.entries {
            if let Some(t) = entry.next_transmission {
                if next_timestamp > t {
                    next_timestamp = t;
                }
            }
        }
        next_timestamp
    }

    fn publish_selected_entry(&self, state: &AgentState, selected: PairId) {
        for (i, entry) in state.entries.iter().enumerate() {
            if entry.pair == Some(selected) {
                self.selected_entry.store(Some(Arc::new(SelectedEntry {
                    entry: i,
                    record: entry.record,
                    relay_entry: entry.relay_entry,
                    armed: Arc::clone(&entry.armed),
                })));
                return;
            }
        }
    }

    /// Schedules the entry's next transmission `delay` from now, then shifts
    /// it forward until no other entry transmits within `STUN_PACING_TIME`.
    pub(crate) fn arm_transmission(&self, state: &mut AgentState, id: EntryId, delay: Duration) {
        let limit = match state.selected_pair {
            Some(selected) => {
                state.pairs[selected].nominated
                    || (state.mode == Role::Controlling && state.entries[id].pair != Some(selected))
            }
            None => false,
        };

        let now = Instant::now();
        {
            let entry = &mut state.entries[id];
            entry.armed.store(true, Ordering::SeqCst);

            if entry.state != EntryState::SucceededKeepalive {
                entry.state = EntryState::Pending;
            }
            entry.next_transmission = Some(now + delay);

            if entry.state == EntryState::Pending {
                entry.retransmissions = if limit {
                    1
                } else {
                    i64::from(self.config.max_retransmission_count)
                };
                entry.retransmission_timeout = self.config.min_retransmission_timeout;
            }
        }

        // Find a time slot respecting the pacing gap across all entries.
        let mut t = state.entries[id].next_transmission.unwrap_or(now);
        let mut moved = true;
        while moved {
            moved = false;
            for (j, other) in state.entries.iter().enumerate() {
                if j == id {
                    continue;
                }
                if let Some(other_t) = other.next_transmission {
                    let gap = if t >= other_t {
                        t.duration_since(other_t)
                    } else {
                        other_t.duration_since(t)
                    };
                    if gap < STUN_PACING_TIME {
                        t = other_t + STUN_PACING_TIME;
                        moved = true;
                        break;
                    }
                }
            }
        }
        state.entries[id].next_transmission = Some(t);
    }

    /// Demultiplexes one inbound datagram. `relayed` carries the local
    /// relayed address when the datagram was forwarded by a TURN server.
    pub(crate) fn input(
        &self,
        state: &mut AgentState,
        buf: &[u8],
        src: SocketAddr,
        relayed: Option<SocketAddr>,
    ) {
        if buf.is_empty() {
            // Empty datagram, used as a wakeup.
            return;
        }

        log::trace!(
            "received datagram{}, size={}",
            if relayed.is_some() { " via relay" } else { "" },
            buf.len()
        );

        if stun::message::is_message(buf) {
            let mut msg = Message::new();
            if let Err(err) = msg.write(buf) {
                log::warn!("STUN message reading failed: {}", err);
                return;
            }
            self.dispatch_stun(state, &mut msg, src, relayed);
            return;
        }

        let entry_id = match self.find_entry_from_record(state, &src, relayed.as_ref()) {
            Some(id) => id,
            None => {
                log::warn!("received a datagram from unknown address, ignoring");
                return;
            }
        };

        match state.entries[entry_id].kind {
            EntryKind::Check => {
                log::debug!("received application datagram");
                self.emit(AgentEvent::Data(buf.to_vec()));
            }
            EntryKind::Relay if turn::proto::chandata::ChannelData::is_channel_data(buf) => {
                self.process_channel_data(state, entry_id, buf);
            }
            _ => {
                log::warn!("received unexpected non-STUN datagram, ignoring");
            }
        }
    }

    fn dispatch_stun(
        &self,
        state: &mut AgentState,
        msg: &mut Message,
        src: SocketAddr,
        relayed: Option<SocketAddr>,
    ) {
        use stun::attributes::ATTR_MESSAGE_INTEGRITY;

        let has_integrity = msg.contains(ATTR_MESSAGE_INTEGRITY);

        if msg.typ.method == METHOD_BINDING && has_integrity {
            // A message from the remote peer, verify it now.
            if self.verify_stun_binding(state, msg, &src).is_err() {
                log::warn!("STUN message verification failed");
                return;
            }
            if msg.typ.class == CLASS_REQUEST && relayed.is_none() {
                if let Err(err) = self.add_remote_reflexive_candidate(state, msg, &src) {
                    log::warn!("failed to add remote peer reflexive candidate: {}", err);
                }
            }
        }

        let is_response =
            msg.typ.class == CLASS_SUCCESS_RESPONSE || msg.typ.class == CLASS_ERROR_RESPONSE;

        let entry_id = if is_response {
            let id = msg.transaction_id;
            state.entries.iter().position(|e| {
                e.transaction_id == id
                    || e.turn
                        .as_ref()
                        .map(|t| t.map.matches_transaction(&id))
                        .unwrap_or(false)
            })
        } else {
            self.find_entry_from_record(state, &src, relayed.as_ref())
        };

        let entry_id = match entry_id {
            Some(id) => id,
            None if is_response => {
                log::warn!("no STUN entry matching transaction id, ignoring");
                return;
            }
            None => {
                // This may happen normally, for instance when there is no
                // space left for reflexive candidates.
                log::debug!("no STUN entry matching remote address, ignoring");
                return;
            }
        };

        match msg.typ.method {
            METHOD_BINDING => {
                if state.entries[entry_id].kind == EntryKind::Check
                    && !has_integrity
                    && (msg.typ.class == CLASS_REQUEST || msg.typ.class == CLASS_SUCCESS_RESPONSE)
                {
                    log::warn!("missing integrity in STUN Binding message from remote peer");
                    return;
                }
                self.process_stun_binding(state, msg, entry_id, &src, relayed.as_ref());
            }
            METHOD_ALLOCATE | METHOD_REFRESH => {
                if self.verify_turn_credentials(state, entry_id, msg).is_err() {
                    log::warn!("ignoring invalid TURN Allocate message");
                    return;
                }
                self.process_turn_allocate(state, msg, entry_id);
            }
            METHOD_CREATE_PERMISSION => {
                if self.verify_turn_credentials(state, entry_id, msg).is_err() {
                    log::warn!("ignoring invalid TURN CreatePermission message");
                    return;
                }
                self.process_turn_create_permission(state, msg, entry_id);
            }
            METHOD_CHANNEL_BIND => {
                if self.verify_turn_credentials(state, entry_id, msg).is_err() {
                    log::warn!("ignoring invalid TURN ChannelBind message");
                    return;
                }
                self.process_turn_channel_bind(state, msg, entry_id);
            }
            METHOD_DATA => {
                self.process_turn_data(state, msg, entry_id);
            }
            method => {
                log::warn!("unknown STUN method {:?}, ignoring", method);
            }
        }
    }

    /// Entry lookup by incoming address: published selected entry when
    /// completed, then highest-priority matching pair, then direct match.
    pub(crate) fn find_entry_from_record(
        &self,
        state: &AgentState,
        record: &SocketAddr,
        relayed: Option<&SocketAddr>,
    ) -> Option<EntryId> {
        let local_is_relayed_at = |pid: PairId, addr: &SocketAddr| -> bool {
            match state.pairs[pid].local {
                Some(lid) => {
                    let local = state.local.candidate(lid);
                    local.kind == CandidateType::Relay && local.resolved == *addr
                }
                None => false,
            }
        };

        if self.connection_state() == ConnectionState::Completed {
            if let Some(selected) = self.selected_entry.load_full() {
                let entry = &state.entries[selected.entry];
                let matches = match relayed {
                    Some(r) => {
                        entry
                            .pair
                            .map(|pid| local_is_relayed_at(pid, r))
                            .unwrap_or(false)
                            && entry.record == *record
                    }
                    None => entry.record == *record,
                };
                if matches {
                    log::debug!("STUN selected entry matching incoming address");
                    return Some(selected.entry);
                }
            }
        }

        if let Some(r) = relayed {
            return state.entries.iter().position(|e| {
                e.pair.map(|pid| local_is_relayed_at(pid, r)).unwrap_or(false)
                    && e.record == *record
            });
        }

        // Match pairs by priority first.
        for &pid in &state.ordered_pairs {
            if state.remote.candidate(state.pairs[pid].remote).resolved == *record {
                if let Some(i) = state.entries.iter().position(|e| e.pair == Some(pid)) {
                    log::debug!("STUN entry {} matching incoming address", i);
                    return Some(i);
                }
            }
        }

        // Match entries directly.
        state.entries.iter().position(|e| e.record == *record)
    }

    /// Considers gathering done once no server or relay entry is pending.
    pub(crate) fn update_gathering_done(&self, state: &mut AgentState) {
        log::trace!("updating gathering status");
        for entry in &state.entries {
            if entry.kind != EntryKind::Check && entry.state == EntryState::Pending {
                return;
            }
        }
        if !state.gathering_done {
            log::info!("candidate gathering done");
            state.local.finished = true;
            state.gathering_done = true;
            self.emit(AgentEvent::GatheringDone);
        }
    }

    pub(crate) async fn set_remote_description(&self, sdp: &str) -> Result<()> {
        let parsed = parse_description(sdp)?;
        if parsed.ufrag.is_empty() {
            return Err(Error::ErrRemoteUfragEmpty);
        }
        if parsed.pwd.is_empty() {
            return Err(Error::ErrRemotePwdEmpty);
        }

        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            state.remote.ufrag = parsed.ufrag;
            state.remote.pwd = parsed.pwd;
            if parsed.finished {
                state.remote.finished = true;
            }

            // Only one component, so every existing pair can be unfrozen
            // now that the remote credentials are known.
            log::debug!("unfreezing {} existing candidate pairs", state.pairs.len());
            for pid in 0..state.pairs.len() {
                self.unfreeze_candidate_pair(state, pid);
            }

            log::debug!(
                "adding {} candidates from remote description",
                parsed.candidates.len()
            );
            for candidate in parsed.candidates {
                if state
                    .remote
                    .find_candidate_from_addr(&candidate.resolved, candidate.kind)
                    .is_some()
                {
                    continue;
                }
                match state.remote.add_candidate(candidate) {
                    Ok(id) => {
                        if let Err(err) = self.add_candidate_pairs_for_remote(state, id) {
                            log::warn!("failed to add candidate pair: {}", err);
                        }
                    }
                    Err(err) => log::warn!("failed to add remote candidate: {}", err),
                }
            }

            if state.mode == Role::Unspecified {
                log::debug!("assuming controlled mode");
                state.mode = Role::Controlled;
            }
        }
        self.interrupt();
        Ok(())
    }

    pub(crate) async fn add_remote_candidate(&self, line: &str) -> Result<()> {
        let candidate = unmarshal_candidate(line)?;

        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            if state
                .remote
                .find_candidate_from_addr(&candidate.resolved, candidate.kind)
                .is_some()
            {
                log::debug!("remote candidate already known: {}", candidate);
                return Ok(());
            }
            let id = state.remote.add_candidate(candidate)?;
            self.add_candidate_pairs_for_remote(state, id)?;
        }
        self.interrupt();
        Ok(())
    }

    /// One pair with an undifferentiated local side, plus one per local
    /// relayed candidate with a matching address family.
    pub(crate) fn add_candidate_pairs_for_remote(
        &self,
        state: &mut AgentState,
        remote: CandidateId,
    ) -> Result<()> {
        // Local non-relayed candidates are undifferentiated for sending:
        // everything leaves from the same socket, so no local candidate is
        // needed on the pair.
        self.add_candidate_pair(state, None, remote)?;

        // Local relayed candidates do have to be differentiated.
        for lid in 0..state.local.candidates.len() {
            let local = &state.local.candidates[lid];
            if local.kind == CandidateType::Relay
                && local.resolved.is_ipv4() == state.remote.candidate(remote).resolved.is_ipv4()
            {
                self.add_candidate_pair(state, Some(lid), remote)?;
            }
        }
        Ok(())
    }

    pub(crate) fn add_candidate_pair(
        &self,
        state: &mut AgentState,
        local: Option<CandidateId>,
        remote: CandidateId,
    ) -> Result<()> {
        if state.pairs.len() >= MAX_CANDIDATE_PAIRS_COUNT {
            return Err(Error::ErrTooManyCandidatePairs);
        }
        if state.entries.len() >= MAX_STUN_ENTRIES_COUNT {
            return Err(Error::ErrTooManyStunEntries);
        }

        // The relay entry carrying the allocation of a relayed local side.
        let relay_entry = match local {
            Some(lid) if state.local.candidate(lid).kind == CandidateType::Relay => {
                let relayed_addr = state.local.candidate(lid).resolved;
                let found = state.entries.iter().position(|e| {
                    e.kind == EntryKind::Relay && e.relayed == Some(relayed_addr)
                });
                match found {
                    Some(id) => Some(id),
                    None => return Err(Error::ErrRelayEntryNotFound),
                }
            }
            _ => None,
        };

        let controlling = state.mode == Role::Controlling;
        let local_priority = local
            .map(|lid| state.local.candidate(lid).priority)
            .unwrap_or_else(|| compute_priority(CandidateType::Host, COMPONENT_DATA));
        let remote_priority = state.remote.candidate(remote).priority;
        let priority = compute_pair_priority(local_priority, remote_priority, controlling);

        log::trace!("adding new candidate pair, priority={}", priority);
        let pid = state.pairs.len();
        state.pairs.push(CandidatePair::new(local, remote, priority));
        self.update_ordered_pairs(state);

        log::trace!(
            "registering STUN entry {} for candidate pair checking",
            state.entries.len()
        );
        let entry_id = state.entries.len();
        let mut entry = StunEntry::new(EntryKind::Check, state.remote.candidate(remote).resolved);
        entry.pair = Some(pid);
        entry.relay_entry = relay_entry;
        state.entries.push(entry);

        #[cfg(feature = "local-address-translation")]
        self.translate_host_candidate_entry(state, entry_id);
        #[cfg(not(feature = "local-address-translation"))]
        let _ = entry_id;

        if state.mode == Role::Controlling {
            for &ordered in &state.ordered_pairs {
                if ordered == pid {
                    log::trace!("candidate pair has priority");
                    break;
                }
                if state.pairs[ordered].state == CandidatePairState::Succeeded {
                    // A higher-priority pair already succeeded, keep the
                    // new one frozen.
                    log::trace!("candidate pair doesn't have priority, keeping it frozen");
                    return Ok(());
                }
            }
        }

        if !state.remote.ufrag.is_empty() {
            log::trace!("unfreezing the new candidate pair");
            self.unfreeze_candidate_pair(state, pid);
        }

        Ok(())
    }

    pub(crate) fn unfreeze_candidate_pair(&self, state: &mut AgentState, pid: PairId) {
        if state.pairs[pid].state != CandidatePairState::Frozen {
            return;
        }

        for i in 0..state.entries.len() {
            if state.entries[i].pair == Some(pid) {
                state.pairs[pid].state = CandidatePairState::Pending;
                state.entries[i].state = EntryState::Pending;
                // Transmit now.
                self.arm_transmission(state, i, Duration::from_secs(0));
                return;
            }
        }

        log::warn!("unable to unfreeze the pair: no matching entry");
    }

    /// Recomputes every pair priority after a role switch. The concrete
    /// local candidate is deliberately left out of the computation.
    pub(crate) fn update_candidate_pairs(&self, state: &mut AgentState) {
        let controlling = state.mode == Role::Controlling;
        for pair in &mut state.pairs {
            let local_priority = compute_priority(CandidateType::Host, COMPONENT_DATA);
            let remote_priority = state.remote.candidates[pair.remote].priority;
            pair.priority = compute_pair_priority(local_priority, remote_priority, controlling);
        }
        self.update_ordered_pairs(state);
    }

    pub(crate) fn update_ordered_pairs(&self, state: &mut AgentState) {
        log::trace!("updating ordered candidate pairs");
        let mut ordered: Vec<PairId> = (0..state.pairs.len()).collect();
        ordered.sort_by(|&a, &b| state.pairs[b].priority.cmp(&state.pairs[a].priority));
        state.ordered_pairs = ordered;
    }

    /// Remote candidate learned from an inbound check: peer reflexive with
    /// the priority carried by the PRIORITY attribute.
    fn add_remote_reflexive_candidate(
        &self,
        state: &mut AgentState,
        msg: &Message,
        src: &SocketAddr,
    ) -> Result<()> {
        if state
            .remote
            .find_candidate_from_addr(src, CandidateType::Unspecified)
            .is_some()
        {
            return Ok(());
        }

        let mut priority_attr = crate::attributes::PriorityAttr::default();
        let _ = priority_attr.get_from(msg);

        let mut candidate = Candidate::new(CandidateType::PeerReflexive, COMPONENT_DATA, *src);
        if priority_attr.0 != 0 {
            candidate.priority = priority_attr.0;
        }

        log::debug!(
            "obtained a new remote reflexive candidate, priority={}",
            candidate.priority
        );
        let id = match state.remote.add_candidate(candidate) {
            Ok(id) => id,
            Err(Error::ErrTooManyCandidates) => {
                log::info!("remote description has the maximum number of candidates, ignoring");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        self.add_candidate_pairs_for_remote(state, id)
    }

    /// Local candidate learned from a mapped address: server reflexive from
    /// servers, peer reflexive from checks. Peer-reflexive candidates are
    /// not reported through the candidate callback.
    pub(crate) fn add_local_reflexive_candidate(
        &self,
        state: &mut AgentState,
        kind: CandidateType,
        addr: SocketAddr,
    ) -> Option<CandidateId> {
        if state
            .local
            .find_candidate_from_addr(&addr, CandidateType::Unspecified)
            .is_some()
        {
            log::trace!("a local candidate exists for the mapped address");
            return None;
        }

        let candidate = Candidate::new(kind, COMPONENT_DATA, addr);
        log::debug!("gathered reflexive candidate: {}", candidate.marshal());

        match state.local.add_candidate(candidate.clone()) {
            Ok(id) => {
                if kind != CandidateType::PeerReflexive {
                    self.emit(AgentEvent::Candidate(candidate));
                }
                Some(id)
            }
            Err(_) => {
                log::info!("local description has the maximum number of candidates, ignoring");
                None
            }
        }
    }

    /// Local relayed candidate from an Allocate success; pairs it with the
    /// known matching-family remote candidates.
    pub(crate) fn add_local_relayed_candidate(
        &self,
        state: &mut AgentState,
        addr: SocketAddr,
    ) -> Result<()> {
        if state
            .local
            .find_candidate_from_addr(&addr, CandidateType::Relay)
            .is_some()
        {
            log::trace!("the relayed local candidate already exists");
            return Ok(());
        }

        let candidate = Candidate::new(CandidateType::Relay, COMPONENT_DATA, addr);
        log::debug!("gathered relayed candidate: {}", candidate.marshal());
        let id = state.local.add_candidate(candidate.clone())?;

        // Relayed candidates are differentiated, match them with the
        // already known remote candidates.
        for rid in 0..state.remote.candidates.len() {
            if state.remote.candidate(rid).resolved.is_ipv4() == addr.is_ipv4() {
                if let Err(err) = self.add_candidate_pair(state, Some(id), rid) {
                    log::warn!("failed to add candidate pair: {}", err);
                }
            }
        }

        self.emit(AgentEvent::Candidate(candidate));
        Ok(())
    }

    /// When the check destination is one of our own host addresses, loop
    /// the traffic back through localhost instead.
    #[cfg(feature = "local-address-translation")]
    fn translate_host_candidate_entry(&self, state: &mut AgentState, entry_id: EntryId) {
        let remote_is_host = state.entries[entry_id]
            .pair
            .map(|pid| {
                state.remote.candidate(state.pairs[pid].remote).kind == CandidateType::Host
            })
            .unwrap_or(false);
        if !remote_is_host {
            return;
        }

        let record = state.entries[entry_id].record;
        let matches_local_host = state
            .local
            .candidates
            .iter()
            .any(|c| c.kind == CandidateType::Host && c.resolved.ip() == record.ip());
        if matches_local_host {
            log::debug!("entry remote address matches local candidate, translating to localhost");
            let loopback: IpAddr = if record.is_ipv4() {
                IpAddr::from([127, 0, 0, 1])
            } else {
                IpAddr::from([0u16, 0, 0, 0, 0, 0, 0, 1])
            };
            state.entries[entry_id].record = SocketAddr::new(loopback, record.port());
        }
    }
}

/// Canonicalizes IPv4-mapped IPv6 source addresses back to IPv4.
pub(crate) fn canonical_addr(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), addr.port()),
            None => addr,
        },
        _ => addr,
    }
}

/// Maps IPv4 destinations onto a dual-stack socket's family.
pub(crate) fn map_destination(socket: &UdpSocket, dst: SocketAddr) -> Result<SocketAddr> {
    let local = socket.local_addr()?;
    Ok(match (local.ip(), dst.ip()) {
        (IpAddr::V6(_), IpAddr::V4(v4)) => {
            SocketAddr::new(IpAddr::V6(v4.to_ipv6_mapped()), dst.port())
        }
        _ => dst,
    })
}

pub(crate) fn is_transient_recv_error(err: &std::io::Error) -> bool {
    // A previous send elicited an ICMP unreachable that surfaces on the
    // next receive. The datagram is lost, the socket is still usable.
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionRefused
    )
}
