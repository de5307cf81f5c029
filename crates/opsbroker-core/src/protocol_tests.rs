// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn parse_rejects_missing_fields() {
    assert!(Envelope::parse(r#"{"id":"1","timestamp":1,"payload":{}}"#).is_err());
    assert!(Envelope::parse(r#"{"type":"PING","timestamp":1,"payload":{}}"#).is_err());
    assert!(Envelope::parse(r#"{"type":"PING","id":"1","payload":{}}"#).is_err());
    assert!(Envelope::parse(r#"{"type":"PING","id":"1","timestamp":1}"#).is_err());
}

#[test]
fn parse_rejects_non_object_payload() {
    assert!(Envelope::parse(r#"{"type":"PING","id":"1","timestamp":1,"payload":"x"}"#).is_err());
}

#[test]
fn parse_rejects_empty_type_or_id() {
    assert!(Envelope::parse(r#"{"type":"","id":"1","timestamp":1,"payload":{}}"#).is_err());
    assert!(Envelope::parse(r#"{"type":"PING","id":"","timestamp":1,"payload":{}}"#).is_err());
}

#[test]
fn parse_accepts_well_formed_envelope() {
    let env = Envelope::parse(r#"{"type":"PING","id":"abc","timestamp":123,"payload":{}}"#).unwrap();
    assert_eq!(env.kind, "PING");
    assert_eq!(env.id, "abc");
    assert_eq!(env.timestamp, 123);
}

#[test]
fn message_type_aliases_command_complete() {
    assert_eq!(MessageType::parse("COMMAND_COMPLETE"), Some(MessageType::CommandResult));
    assert_eq!(MessageType::parse("COMMAND_RESULT"), Some(MessageType::CommandResult));
}

#[test]
fn message_type_roundtrips_as_str() {
    for mt in [MessageType::DashboardInit, MessageType::CommandRequest, MessageType::TerminalStream] {
        assert_eq!(MessageType::parse(mt.as_str()), Some(mt));
    }
}

#[test]
fn dashboard_and_agent_allowed_sets_are_disjoint_on_directional_types() {
    assert!(MessageType::CommandRequest.dashboard_allowed());
    assert!(!MessageType::CommandRequest.agent_allowed());
    assert!(MessageType::TerminalStream.agent_allowed());
    assert!(!MessageType::TerminalStream.dashboard_allowed());
}
