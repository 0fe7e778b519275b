use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::textattrs::TextAttribute;

use super::*;

#[test]
fn test_controlled_get_from() -> Result<(), stun::Error> {
    let mut m = Message::new();
    let mut c = AttrControlled::default();

    assert!(c.get_from(&m).is_err());

    m.build(&[Box::new(BINDING_REQUEST), Box::new(AttrControlled(4321))])?;

    let mut m1 = Message::new();
    m1.write(&m.raw)?;

    c.get_from(&m1)?;
    assert_eq!(c.0, 4321);

    Ok(())
}

#[test]
fn test_controlling_get_from() -> Result<(), stun::Error> {
    let mut m = Message::new();
    let mut c = AttrControlling::default();

    assert!(c.get_from(&m).is_err());

    m.build(&[Box::new(BINDING_REQUEST), Box::new(AttrControlling(1234))])?;

    let mut m1 = Message::new();
    m1.write(&m.raw)?;

    c.get_from(&m1)?;
    assert_eq!(c.0, 1234);

    Ok(())
}

#[test]
fn test_use_candidate_attr() -> Result<(), stun::Error> {
    let mut m = Message::new();
    m.build(&[Box::new(BINDING_REQUEST), Box::new(UseCandidateAttr::new())])?;

    let mut m1 = Message::new();
    m1.write(&m.raw)?;

    assert!(UseCandidateAttr::is_set(&m1));
    assert!(!UseCandidateAttr::is_set(&Message::new()));

    Ok(())
}

#[test]
fn test_priority_attr_round_trip() -> Result<(), stun::Error> {
    let mut m = Message::new();
    m.build(&[Box::new(BINDING_REQUEST), Box::new(PriorityAttr(0x6e0001ff))])?;

    let mut m1 = Message::new();
    m1.write(&m.raw)?;

    let mut p = PriorityAttr::default();
    p.get_from(&m1)?;
    assert_eq!(p.0, 0x6e0001ff);

    Ok(())
}

// RFC 8489 (nee RFC 5769) sample request: a Binding request carrying
// SOFTWARE, PRIORITY, ICE-CONTROLLED, USERNAME, MESSAGE-INTEGRITY and
// FINGERPRINT, keyed with the short-term password "VOkJxbRl1RmTxUk/WvJxBt".
const SAMPLE_REQUEST: [u8; 108] = [
    0x00, 0x01, 0x00, 0x58, // Request type and message length
    0x21, 0x12, 0xa4, 0x42, // Magic cookie
    0xb7, 0xe7, 0xa7, 0x01, // Transaction ID
    0xbc, 0x34, 0xd6, 0x86, //
    0xfa, 0x87, 0xdf, 0xae, //
    0x80, 0x22, 0x00, 0x10, // SOFTWARE attribute header
    0x53, 0x54, 0x55, 0x4e, //
    0x20, 0x74, 0x65, 0x73, //
    0x74, 0x20, 0x63, 0x6c, //
    0x69, 0x65, 0x6e, 0x74, //
    0x00, 0x24, 0x00, 0x04, // PRIORITY attribute header
    0x6e, 0x00, 0x01, 0xff, //
    0x80, 0x29, 0x00, 0x08, // ICE-CONTROLLED attribute header
    0x93, 0x2f, 0xf9, 0xb1, //
    0x51, 0x26, 0x3b, 0x36, //
    0x00, 0x06, 0x00, 0x09, // USERNAME attribute header
    0x65, 0x76, 0x74, 0x6a, //
    0x3a, 0x68, 0x36, 0x76, //
    0x59, 0x20, 0x20, 0x20, //
    0x00, 0x08, 0x00, 0x14, // MESSAGE-INTEGRITY attribute header
    0x9a, 0xea, 0xa7, 0x0c, //
    0xbf, 0xd8, 0xcb, 0x56, //
    0x78, 0x1e, 0xf2, 0xb5, //
    0xb2, 0xd3, 0xf2, 0x49, //
    0xc1, 0xb5, 0x71, 0xa2, //
    0x80, 0x28, 0x00, 0x04, // FINGERPRINT attribute header
    0xe5, 0x7a, 0x3b, 0xcf, //
];

#[test]
fn test_rfc8489_sample_request() -> Result<(), stun::Error> {
    let mut m = Message::new();
    m.write(&SAMPLE_REQUEST)?;

    assert_eq!(m.typ, BINDING_REQUEST);
    assert_eq!(&m.transaction_id.0[..], &SAMPLE_REQUEST[8..20]);

    let mut priority = PriorityAttr::default();
    priority.get_from(&m)?;
    assert_eq!(priority.0, 0x6e0001ff);

    let mut controlled = AttrControlled::default();
    controlled.get_from(&m)?;
    assert_eq!(controlled.0, 0x932f_f9b1_5126_3b36);

    let username = TextAttribute::get_from_as(&m, ATTR_USERNAME)?;
    assert_eq!(username.text, "evtj:h6vY");

    assert!(m.contains(ATTR_MESSAGE_INTEGRITY));
    let integrity = MessageIntegrity::new_short_term_integrity("VOkJxbRl1RmTxUk/WvJxBt".to_owned());
    integrity.check(&mut m)?;

    FINGERPRINT.check(&m)?;

    Ok(())
}
