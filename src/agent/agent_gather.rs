use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{lookup_host, UdpSocket};
use util::vnet::net::*;

use super::agent_config::*;
use super::agent_internal::*;
use crate::attributes::Role;
use crate::candidate::*;
use crate::error::*;
use crate::relay::{TurnCredentials, TurnMap, TurnState};
use crate::state::ConnectionState;

impl AgentInternal {
    /// Opens the shared UDP socket, gathers host candidates and spawns the
    /// worker. A warning no-op when gathering already started.
    pub(crate) async fn gather_candidates(self: &Arc<Self>) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if self.socket.load().is_some() {
            log::warn!("candidate gathering already started");
            return Ok(());
        }
        if self.stopped.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::ErrClosed);
        }

        let std_socket = bind_udp_in_port_range(self.config.local_port_range)?;
        std_socket.set_nonblocking(true)?;
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        let local_addr = socket.local_addr()?;
        self.socket.store(Some(Arc::clone(&socket)));

        self.change_state(ConnectionState::Gathering);

        let ips =
            local_host_addresses(self.config.include_loopback, local_addr.is_ipv4()).await;
        log::trace!("adding {} local host candidates", ips.len());
        for ip in ips {
            let candidate = Candidate::new(
                CandidateType::Host,
                COMPONENT_DATA,
                SocketAddr::new(ip, local_addr.port()),
            );
            if state
                .local
                .find_candidate_from_addr(&candidate.resolved, CandidateType::Host)
                .is_some()
            {
                continue;
            }
            match state.local.add_candidate(candidate.clone()) {
                Ok(_) => {
                    log::debug!("gathered host candidate: {}", candidate.marshal());
                    self.emit(AgentEvent::Candidate(candidate));
                }
                Err(_) => {
                    log::warn!(
                        "local description already has the maximum number of host candidates"
                    );
                    break;
                }
            }
        }

        if state.mode == Role::Unspecified {
            log::debug!("assuming controlling mode");
            state.mode = Role::Controlling;
        }

        let internal = Arc::clone(self);
        let handle = tokio::spawn(async move { internal.run().await });
        *self.worker_handle.lock().await = Some(handle);

        Ok(())
    }

    fn socket_is_ipv6(&self) -> bool {
        self.socket
            .load_full()
            .and_then(|s| s.local_addr().ok())
            .map(|a| a.is_ipv6())
            .unwrap_or(false)
    }

    /// Registers one Relay entry per configured TURN server, paced apart.
    pub(crate) async fn register_turn_servers(&self, state: &mut AgentState) {
        let accept_ipv6 = self.socket_is_ipv6();
        let servers = self.config.turn_servers.clone();

        let mut count = 0;
        for (i, server) in servers.iter().enumerate() {
            if count >= MAX_RELAY_ENTRIES_COUNT || state.entries.len() >= MAX_STUN_ENTRIES_COUNT {
                break;
            }

            let port = if server.port == 0 {
                DEFAULT_SERVER_PORT
            } else {
                server.port
            };
            let records = match resolve_records(&server.host, port, accept_ipv6).await {
                Ok(records) => records,
                Err(err) => {
                    log::error!("TURN address resolution failed: {}", err);
                    continue;
                }
            };

            // Prefer IPv4 for TURN.
            let record = records
                .iter()
                .find(|a| a.is_ipv4())
                .or_else(|| records.first())
                .copied();
            if let Some(record) = record {
                log::info!("using TURN server {}:{}", server.host, port);
                log::trace!(
                    "registering STUN entry {} for relay request",
                    state.entries.len()
                );

                let mut entry = StunEntry::new(EntryKind::Relay, record);
                entry.state = EntryState::Pending;
                entry.turn = Some(TurnState {
                    credentials: TurnCredentials {
                        username: server.username.clone(),
                        realm: String::new(),
                        nonce: String::new(),
                    },
                    password: server.password.clone(),
                    map: TurnMap::new(),
                });
                let id = state.entries.len();
                state.entries.push(entry);

                self.arm_transmission(state, id, STUN_PACING_TIME * (i as u32));
                count += 1;
            }
        }
    }

    /// Registers Server entries for the resolved STUN server addresses.
    /// Added after the relays so a TURN address matches in priority.
    pub(crate) async fn register_stun_server(&self, state: &mut AgentState) {
        let server = match &self.config.stun_server {
            Some(server) => server.clone(),
            None => return,
        };
        let accept_ipv6 = self.socket_is_ipv6();

        let port = if server.port == 0 {
            DEFAULT_SERVER_PORT
        } else {
            server.port
        };
        let records = match resolve_records(&server.host, port, accept_ipv6).await {
            Ok(records) => records,
            Err(err) => {
                log::error!("STUN server address resolution failed: {}", err);
                return;
            }
        };

        log::info!("using STUN server {}:{}", server.host, port);
        for (i, record) in records.iter().take(MAX_SERVER_ENTRIES_COUNT).enumerate() {
            if state.entries.len() >= MAX_STUN_ENTRIES_COUNT {
                break;
            }
            log::trace!(
                "registering STUN entry {} for server request",
                state.entries.len()
            );
            let mut entry = StunEntry::new(EntryKind::Server, *record);
            entry.state = EntryState::Pending;
            let id = state.entries.len();
            state.entries.push(entry);

            self.arm_transmission(state, id, STUN_PACING_TIME * (i as u32));
        }
    }
}

async fn resolve_records(host: &str, port: u16, accept_ipv6: bool) -> Result<Vec<SocketAddr>> {
    let mut records: Vec<SocketAddr> = lookup_host((host, port))
        .await?
        .filter(|a| accept_ipv6 || a.is_ipv4())
        .collect();
    records.truncate(MAX_RESOLVER_RECORDS_COUNT);
    if records.is_empty() {
        return Err(Error::Other(format!("no usable address for {}", host)));
    }
    Ok(records)
}

/// Enumerates usable local interface addresses for host candidates.
pub(crate) async fn local_host_addresses(include_loopback: bool, ipv4_only: bool) -> Vec<IpAddr> {
    let net = Net::new(None);
    let interfaces = net.get_interfaces().await;

    let mut ips = vec![];
    for iface in &interfaces {
        for ipnet in iface.addrs() {
            let ip = ipnet.addr();
            if ip.is_unspecified() {
                continue;
            }
            if ip.is_loopback() && !include_loopback {
                continue;
            }
            match ip {
                IpAddr::V6(v6) => {
                    if ipv4_only {
                        continue;
                    }
                    // Link-local addresses need scope ids, skip them.
                    if (v6.segments()[0] & 0xffc0) == 0xfe80 {
                        continue;
                    }
                }
                IpAddr::V4(_) => {}
            }
            if !ips.contains(&ip) {
                ips.push(ip);
            }
        }
    }
    ips
}

fn bind_any(port: u16) -> std::io::Result<std::net::UdpSocket> {
    // Dual-stack socket when available, plain IPv4 otherwise.
    if let Ok(socket) = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)) {
        let _ = socket.set_only_v6(false);
        let addr = SocketAddr::new(IpAddr::from([0u16; 8]), port);
        if socket.bind(&addr.into()).is_ok() {
            return Ok(socket.into());
        }
    }

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    let addr = SocketAddr::new(IpAddr::from([0, 0, 0, 0]), port);
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Binds the shared socket inside the configured port range, starting at a
/// random offset so concurrent agents spread out.
pub(crate) fn bind_udp_in_port_range(range: (u16, u16)) -> Result<std::net::UdpSocket> {
    let (begin, end) = range;
    if begin == 0 && end == 0 {
        return Ok(bind_any(0)?);
    }

    let begin = if begin == 0 { 1 } else { begin };
    let end = if end == 0 { 0xffff } else { end };
    if begin > end {
        return Err(Error::ErrPortRangeInvalid);
    }

    let span = end - begin + 1;
    let start = begin + rand::random::<u16>() % span;
    let mut port = start;
    loop {
        match bind_any(port) {
            Ok(socket) => return Ok(socket),
            Err(err) => log::debug!("failed to listen on port {}: {}", port, err),
        }

        port = if port >= end { begin } else { port + 1 };
        if port == start {
            break;
        }
    }

    Err(Error::ErrNoFreePort)
}
