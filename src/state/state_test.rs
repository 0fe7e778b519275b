use super::*;

#[test]
fn test_connection_state_string() {
    let tests = vec![
        (ConnectionState::Disconnected, "disconnected"),
        (ConnectionState::Gathering, "gathering"),
        (ConnectionState::Connecting, "connecting"),
        (ConnectionState::Connected, "connected"),
        (ConnectionState::Completed, "completed"),
        (ConnectionState::Failed, "failed"),
    ];

    for (state, expected) in tests {
        assert_eq!(state.to_string(), expected);
    }
}

#[test]
fn test_connection_state_from_u8_round_trip() {
    for v in 0u8..=5 {
        let state = ConnectionState::from(v);
        assert_eq!(ConnectionState::from(state as u8), state);
    }
}
