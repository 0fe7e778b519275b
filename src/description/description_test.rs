use super::*;

#[test]
fn test_description_round_trip() -> Result<()> {
    let mut desc = Description::new_local();
    desc.add_candidate(Candidate::new(
        CandidateType::Host,
        COMPONENT_DATA,
        "192.168.1.10:60000".parse().unwrap(),
    ))?;
    desc.add_candidate(Candidate::new(
        CandidateType::ServerReflexive,
        COMPONENT_DATA,
        "203.0.113.9:40123".parse().unwrap(),
    ))?;
    desc.finished = true;

    let parsed = parse_description(&desc.to_string())?;

    assert_eq!(parsed.ufrag, desc.ufrag);
    assert_eq!(parsed.pwd, desc.pwd);
    assert_eq!(parsed.finished, desc.finished);
    assert_eq!(parsed.candidates.len(), desc.candidates.len());
    for (a, b) in parsed.candidates.iter().zip(desc.candidates.iter()) {
        assert_eq!(a.resolved, b.resolved);
        assert_eq!(a.kind, b.kind);
        assert_eq!(a.priority, b.priority);
        assert_eq!(a.foundation, b.foundation);
    }

    Ok(())
}

#[test]
fn test_description_ignores_unrelated_lines() -> Result<()> {
    let raw = "v=0\r\n\
               m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
               a=ice-ufrag:frag\r\n\
               a=ice-pwd:passwordpasswordpassword\r\n\
               a=candidate:4207374051 1 udp 2130706431 10.0.75.1 53634 typ host\r\n";

    let desc = parse_description(raw)?;
    assert_eq!(desc.ufrag, "frag");
    assert_eq!(desc.pwd, "passwordpasswordpassword");
    assert_eq!(desc.candidates.len(), 1);
    assert!(!desc.finished);

    Ok(())
}

#[test]
fn test_description_rejects_garbage() {
    assert_eq!(
        parse_description("not a description at all"),
        Err(Error::ErrParseDescription)
    );
}

#[test]
fn test_host_candidate_cap() {
    let mut desc = Description::new_local();
    for i in 0..MAX_HOST_CANDIDATES_COUNT {
        let addr = format!("10.0.0.{}:4000", i + 1).parse().unwrap();
        desc.add_candidate(Candidate::new(CandidateType::Host, COMPONENT_DATA, addr))
            .unwrap();
    }

    let overflow = Candidate::new(
        CandidateType::Host,
        COMPONENT_DATA,
        "10.0.0.100:4000".parse().unwrap(),
    );
    assert_eq!(
        desc.add_candidate(overflow),
        Err(Error::ErrTooManyCandidates)
    );
}

#[test]
fn test_find_candidate_from_addr() -> Result<()> {
    let mut desc = Description::default();
    let addr: SocketAddr = "10.0.0.1:4000".parse().unwrap();
    let id = desc.add_candidate(Candidate::new(CandidateType::ServerReflexive, COMPONENT_DATA, addr))?;

    assert_eq!(
        desc.find_candidate_from_addr(&addr, CandidateType::Unspecified),
        Some(id)
    );
    assert_eq!(
        desc.find_candidate_from_addr(&addr, CandidateType::ServerReflexive),
        Some(id)
    );
    assert_eq!(desc.find_candidate_from_addr(&addr, CandidateType::Host), None);
    assert_eq!(
        desc.find_candidate_from_addr(&"10.0.0.2:4000".parse().unwrap(), CandidateType::Unspecified),
        None
    );

    Ok(())
}
