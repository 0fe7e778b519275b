use stun::message::*;
use stun::xoraddr::XorMappedAddress;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use super::agent_config::*;
use super::*;
use crate::attributes::Role;
use crate::candidate::CandidateType;

fn test_config() -> AgentConfig {
    let _ = env_logger::builder().is_test(true).try_init();

    AgentConfig {
        local_port_range: (60000, 60100),
        include_loopback: true,
        ..AgentConfig::default()
    }
}

fn watch_completed(agent: &Agent) -> mpsc::Receiver<ConnectionState> {
    let (tx, rx) = mpsc::channel(8);
    agent.on_connection_state_change(Box::new(move |state| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.try_send(state);
        })
    }));
    rx
}

async fn wait_for_state(
    rx: &mut mpsc::Receiver<ConnectionState>,
    wanted: ConnectionState,
    deadline: Duration,
) {
    timeout(deadline, async {
        while let Some(state) = rx.recv().await {
            if state == wanted {
                return;
            }
        }
        panic!("state channel closed before reaching {}", wanted);
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", wanted));
}

async fn exchange_descriptions(controlling: &Agent, controlled: &Agent) {
    controlling.gather_candidates().await.unwrap();
    let offer = controlling.get_local_description().await.to_string();

    // The controlled side learns the remote before gathering, deciding its
    // role.
    controlled.set_remote_description(&offer).await.unwrap();
    controlled.gather_candidates().await.unwrap();
    let answer = controlled.get_local_description().await.to_string();

    controlling.set_remote_description(&answer).await.unwrap();

    controlling.set_remote_gathering_done().await;
    controlled.set_remote_gathering_done().await;
}

// Two agents on loopback, no servers: both must complete and forward
// datagrams in both directions over host candidates.
#[tokio::test]
async fn test_connectivity_host_to_host() {
    let a = Agent::new(test_config()).await.unwrap();
    let b = Agent::new(test_config()).await.unwrap();

    let mut a_states = watch_completed(&a);
    let mut b_states = watch_completed(&b);

    let (a_data_tx, mut a_data_rx) = mpsc::channel::<Vec<u8>>(8);
    a.on_data(Box::new(move |data| {
        let tx = a_data_tx.clone();
        Box::pin(async move {
            let _ = tx.try_send(data);
        })
    }));
    let (b_data_tx, mut b_data_rx) = mpsc::channel::<Vec<u8>>(8);
    b.on_data(Box::new(move |data| {
        let tx = b_data_tx.clone();
        Box::pin(async move {
            let _ = tx.try_send(data);
        })
    }));

    exchange_descriptions(&a, &b).await;

    wait_for_state(&mut a_states, ConnectionState::Completed, Duration::from_secs(2)).await;
    wait_for_state(&mut b_states, ConnectionState::Completed, Duration::from_secs(2)).await;

    let (local, remote) = a.get_selected_candidate_pair().await.unwrap();
    assert_eq!(local.kind, CandidateType::Host);
    assert_eq!(remote.kind, CandidateType::Host);

    a.send(b"ping").await.unwrap();
    let received = timeout(Duration::from_secs(1), b_data_rx.recv())
        .await
        .expect("no datagram received")
        .unwrap();
    assert_eq!(received, b"ping");

    b.send(b"pong").await.unwrap();
    let received = timeout(Duration::from_secs(1), a_data_rx.recv())
        .await
        .expect("no datagram received")
        .unwrap();
    assert_eq!(received, b"pong");

    a.close().await.unwrap();
    b.close().await.unwrap();
}

// Both sides gather first and assume the controlling role; the role
// conflict must resolve through 487 and the session still complete.
#[tokio::test]
async fn test_role_conflict_resolution() {
    let a = Agent::new(test_config()).await.unwrap();
    let b = Agent::new(test_config()).await.unwrap();

    let mut a_states = watch_completed(&a);
    let mut b_states = watch_completed(&b);

    // Gather before exchanging: both assume the controlling role.
    a.gather_candidates().await.unwrap();
    b.gather_candidates().await.unwrap();

    let offer = a.get_local_description().await.to_string();
    let answer = b.get_local_description().await.to_string();
    a.set_remote_description(&answer).await.unwrap();
    b.set_remote_description(&offer).await.unwrap();
    a.set_remote_gathering_done().await;
    b.set_remote_gathering_done().await;

    wait_for_state(&mut a_states, ConnectionState::Completed, Duration::from_secs(5)).await;
    wait_for_state(&mut b_states, ConnectionState::Completed, Duration::from_secs(5)).await;

    let a_mode = a.internal.state.lock().await.mode;
    let b_mode = b.internal.state.lock().await.mode;
    assert_ne!(a_mode, b_mode, "exactly one side must have switched roles");
    assert!(a_mode == Role::Controlling || a_mode == Role::Controlled);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

// No candidates are ever exchanged: both agents must fail once the fail
// deadline passes, not earlier.
#[tokio::test]
async fn test_fail_deadline() {
    let config = || AgentConfig {
        fail_timeout: Duration::from_millis(200),
        ..test_config()
    };
    let a = Agent::new(config()).await.unwrap();
    let b = Agent::new(config()).await.unwrap();

    let mut a_states = watch_completed(&a);
    let mut b_states = watch_completed(&b);

    a.gather_candidates().await.unwrap();
    b.gather_candidates().await.unwrap();

    wait_for_state(&mut a_states, ConnectionState::Failed, Duration::from_secs(2)).await;
    wait_for_state(&mut b_states, ConnectionState::Failed, Duration::from_secs(2)).await;

    assert!(a.send(b"data").await.is_err());

    a.close().await.unwrap();
    b.close().await.unwrap();
}

// Minimal STUN server: answers every Binding request with a fixed
// XOR-MAPPED-ADDRESS.
async fn spawn_mock_stun_server(mapped: std::net::SocketAddr) -> std::net::SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let local = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while let Ok((n, src)) = socket.recv_from(&mut buf).await {
            let mut msg = Message::new();
            if msg.write(&buf[..n]).is_err() {
                continue;
            }
            if msg.typ != BINDING_REQUEST {
                continue;
            }

            let mut response = Message::new();
            response
                .build(&[
                    Box::new(BINDING_SUCCESS),
                    Box::new(msg.transaction_id),
                    Box::new(XorMappedAddress {
                        ip: mapped.ip(),
                        port: mapped.port(),
                    }),
                ])
                .unwrap();
            let _ = socket.send_to(&response.raw, src).await;
        }
    });

    local
}

// Server-reflexive discovery against a mock STUN server: the srflx
// candidate is emitted exactly once, then gathering completes.
#[tokio::test]
async fn test_server_reflexive_discovery() {
    let mapped = "203.0.113.7:31234".parse().unwrap();
    let server = spawn_mock_stun_server(mapped).await;

    let config = AgentConfig {
        stun_server: Some(StunServerConfig::new(server.ip().to_string(), server.port())),
        ..test_config()
    };
    let agent = Agent::new(config).await.unwrap();

    let (candidates_tx, mut candidates_rx) = mpsc::channel::<Option<Candidate>>(16);
    agent.on_candidate(Box::new(move |candidate| {
        let tx = candidates_tx.clone();
        Box::pin(async move {
            let _ = tx.try_send(candidate);
        })
    }));

    agent.gather_candidates().await.unwrap();

    let mut srflx = vec![];
    timeout(Duration::from_secs(5), async {
        while let Some(candidate) = candidates_rx.recv().await {
            match candidate {
                Some(c) => {
                    if c.kind == CandidateType::ServerReflexive {
                        srflx.push(c);
                    }
                }
                // Gathering done.
                None => break,
            }
        }
    })
    .await
    .expect("gathering did not finish");

    assert_eq!(srflx.len(), 1, "expected exactly one srflx candidate");
    assert_eq!(srflx[0].resolved, mapped);

    agent.close().await.unwrap();
}

// Relay-only connectivity needs a real TURN server; provide one through
// ICELINK_TEST_TURN_SERVER / _USERNAME / _PASSWORD and remove the ignore.
#[tokio::test]
#[ignore]
async fn test_connectivity_via_relay() {
    let server = std::env::var("ICELINK_TEST_TURN_SERVER").expect("ICELINK_TEST_TURN_SERVER");
    let username = std::env::var("ICELINK_TEST_TURN_USERNAME").unwrap_or_default();
    let password = std::env::var("ICELINK_TEST_TURN_PASSWORD").unwrap_or_default();
    let (host, port) = server.split_once(':').expect("host:port");

    let config = || AgentConfig {
        turn_servers: vec![TurnServerConfig {
            host: host.to_owned(),
            port: port.parse().unwrap(),
            username: username.clone(),
            password: password.clone(),
        }],
        ..test_config()
    };

    let a = Agent::new(config()).await.unwrap();
    let b = Agent::new(config()).await.unwrap();

    let (relay_tx, mut relay_rx) = mpsc::channel::<Candidate>(8);
    a.on_candidate(Box::new(move |candidate| {
        let tx = relay_tx.clone();
        Box::pin(async move {
            if let Some(c) = candidate {
                if c.kind == CandidateType::Relay {
                    let _ = tx.try_send(c);
                }
            }
        })
    }));

    let mut a_states = watch_completed(&a);
    let mut b_states = watch_completed(&b);

    exchange_descriptions(&a, &b).await;

    timeout(Duration::from_secs(10), relay_rx.recv())
        .await
        .expect("no relayed candidate gathered")
        .unwrap();

    wait_for_state(&mut a_states, ConnectionState::Completed, Duration::from_secs(10)).await;
    wait_for_state(&mut b_states, ConnectionState::Completed, Duration::from_secs(10)).await;

    a.send(b"relayed ping").await.unwrap();

    a.close().await.unwrap();
    b.close().await.unwrap();
}

// The datagram path keeps working under a burst of sends right after
// completion (keepalive rearm races with the send path).
#[tokio::test]
async fn test_send_burst_after_completion() {
    let a = Agent::new(test_config()).await.unwrap();
    let b = Agent::new(test_config()).await.unwrap();

    let mut a_states = watch_completed(&a);
    let mut b_states = watch_completed(&b);

    let (b_data_tx, mut b_data_rx) = mpsc::channel::<Vec<u8>>(64);
    b.on_data(Box::new(move |data| {
        let tx = b_data_tx.clone();
        Box::pin(async move {
            let _ = tx.try_send(data);
        })
    }));

    exchange_descriptions(&a, &b).await;
    wait_for_state(&mut a_states, ConnectionState::Completed, Duration::from_secs(2)).await;
    wait_for_state(&mut b_states, ConnectionState::Completed, Duration::from_secs(2)).await;

    for i in 0..10u8 {
        a.send(&[i; 32]).await.unwrap();
    }

    let mut received = 0;
    while received < 10 {
        match timeout(Duration::from_secs(1), b_data_rx.recv()).await {
            Ok(Some(_)) => received += 1,
            _ => break,
        }
    }
    // UDP on loopback should not drop anything.
    assert_eq!(received, 10);

    a.close().await.unwrap();
    b.close().await.unwrap();
}
