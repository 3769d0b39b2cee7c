//! Link-control frames of the Three-Wire UART link establishment handshake,
//!  plus the bare acknowledgement and reset frames.
//!
//! The payload byte patterns are fixed by the specification:
//!
//! ```ascii
//! | type | name            | byte pattern
//! |------+-----------------+---------------------------
//! |  15  | SYNC            | 0x01 0x7E
//! |  15  | SYNC RESPONSE   | 0x02 0x7D
//! |  15  | CONFIG          | 0x03 0xFC <config field>
//! |  15  | CONFIG RESPONSE | 0x04 0x7B <config field>
//! |  15  | WAKEUP          | 0x05 0xFA
//! |  15  | WOKEN           | 0x06 0xF9
//! |  15  | SLEEP           | 0x07 0x78
//! |   5  | RESET           | (empty)
//! |   0  | ACK             | (empty)
//! ```
//!
//! WAKEUP, WOKEN and SLEEP belong to the low-power extension and are only
//!  recognized for packet traces, never acted upon.

use std::fmt::Write;

use crate::packet_header::PacketType;

pub const SYNC_PATTERN: [u8; 2] = [0x01, 0x7E];
pub const SYNC_RESPONSE_PATTERN: [u8; 2] = [0x02, 0x7D];
pub const SYNC_CONFIG_PATTERN: [u8; 2] = [0x03, 0xFC];
pub const SYNC_CONFIG_RESPONSE_PATTERN: [u8; 2] = [0x04, 0x7B];
pub const WAKEUP_PATTERN: [u8; 2] = [0x05, 0xFA];
pub const WOKEN_PATTERN: [u8; 2] = [0x06, 0xF9];
pub const SLEEP_PATTERN: [u8; 2] = [0x07, 0x78];

/// The config field announced in CONFIG / CONFIG RESPONSE: sliding window
///  size 1 (bits 0-2), no out-of-frame software flow control (bit 3), CRC
///  data-integrity checks (bit 4), version 0 (bits 5-7).
pub const SYNC_CONFIG_FIELD: u8 = 0x11;

/// The control frames this transport can transmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPacket {
    Reset,
    Sync,
    SyncResponse,
    SyncConfig,
    SyncConfigResponse,
    Ack,
}

impl ControlPacket {
    pub fn packet_type(&self) -> PacketType {
        match self {
            ControlPacket::Reset => PacketType::Reset,
            ControlPacket::Ack => PacketType::Ack,
            ControlPacket::Sync
            | ControlPacket::SyncResponse
            | ControlPacket::SyncConfig
            | ControlPacket::SyncConfigResponse => PacketType::LinkControl,
        }
    }

    pub fn payload(&self) -> &'static [u8] {
        match self {
            ControlPacket::Reset | ControlPacket::Ack => &[],
            ControlPacket::Sync => &SYNC_PATTERN,
            ControlPacket::SyncResponse => &SYNC_RESPONSE_PATTERN,
            ControlPacket::SyncConfig => &[0x03, 0xFC, SYNC_CONFIG_FIELD],
            ControlPacket::SyncConfigResponse => &[0x04, 0x7B, SYNC_CONFIG_FIELD],
        }
    }
}

/// Checks whether `pattern` occurs in `packet` starting at `offset`. Offsets
///  at or past the end of the packet never match, and a pattern running past
///  the end of the packet does not match either.
pub fn check_pattern(packet: &[u8], offset: usize, pattern: &[u8]) -> bool {
    if offset >= packet.len() {
        return false;
    }

    match packet.get(offset..offset + pattern.len()) {
        Some(window) => window == pattern,
        None => false,
    }
}

pub fn is_sync(payload: &[u8]) -> bool {
    check_pattern(payload, 0, &SYNC_PATTERN)
}

pub fn is_sync_response(payload: &[u8]) -> bool {
    check_pattern(payload, 0, &SYNC_RESPONSE_PATTERN)
}

/// CONFIG and CONFIG RESPONSE are recognized by their first two bytes only,
///  so a peer announcing a different config field is still answered.
pub fn is_sync_config(payload: &[u8]) -> bool {
    check_pattern(payload, 0, &SYNC_CONFIG_PATTERN)
}

pub fn is_sync_config_response(payload: &[u8]) -> bool {
    check_pattern(payload, 0, &SYNC_CONFIG_RESPONSE_PATTERN)
}

fn describe_config_field(config: u8) -> String {
    format!(
        "sliding-window-size:{} out-of-frame:{} data-integrity-check-type:{} version-number:{}",
        config & 0x07,
        (config >> 3) & 0x01,
        (config >> 4) & 0x01,
        (config >> 5) & 0x07,
    )
}

/// Renders a link-control payload for packet traces.
pub fn describe_link_control(payload: &[u8]) -> String {
    let mut out = String::new();

    if payload.len() >= 2 {
        out.push('[');
        if is_sync(payload) {
            out.push_str("SYNC");
        } else if is_sync_response(payload) {
            out.push_str("SYNC_RESP");
        } else if is_sync_config(payload) && payload.len() >= 3 {
            let _ = write!(out, "CONFIG [{}]", describe_config_field(payload[2]));
        } else if is_sync_config_response(payload) && payload.len() >= 3 {
            let _ = write!(out, "CONFIG_RESP [{}]", describe_config_field(payload[2]));
        } else if check_pattern(payload, 0, &WAKEUP_PATTERN) {
            out.push_str("WAKEUP");
        } else if check_pattern(payload, 0, &WOKEN_PATTERN) {
            out.push_str("WOKEN");
        } else if check_pattern(payload, 0, &SLEEP_PATTERN) {
            out.push_str("SLEEP");
        }
        out.push(']');
    }

    out
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::at_start(0, false)]
    #[case::off_by_one(1, false)]
    #[case::matching(4, true)]
    #[case::at_end(8, false)]
    #[case::past_end(100, false)]
    fn test_check_pattern(#[case] offset: usize, #[case] expected: bool) {
        let packet = [0xFF, 0x01, 0x02, 0xFF, 0x01, 0x02, 0x03, 0xFF];
        let pattern = [0x01, 0x02, 0x03];

        assert_eq!(check_pattern(&packet, offset, &pattern), expected);
    }

    #[rstest]
    #[case::sync(ControlPacket::Sync, PacketType::LinkControl, vec![0x01, 0x7E])]
    #[case::sync_response(ControlPacket::SyncResponse, PacketType::LinkControl, vec![0x02, 0x7D])]
    #[case::sync_config(ControlPacket::SyncConfig, PacketType::LinkControl, vec![0x03, 0xFC, 0x11])]
    #[case::sync_config_response(ControlPacket::SyncConfigResponse, PacketType::LinkControl, vec![0x04, 0x7B, 0x11])]
    #[case::reset(ControlPacket::Reset, PacketType::Reset, vec![])]
    #[case::ack(ControlPacket::Ack, PacketType::Ack, vec![])]
    fn test_control_packet(
        #[case] packet: ControlPacket,
        #[case] expected_type: PacketType,
        #[case] expected_payload: Vec<u8>,
    ) {
        assert_eq!(packet.packet_type(), expected_type);
        assert_eq!(packet.payload(), &expected_payload[..]);
    }

    #[rstest]
    #[case::sync(vec![0x01, 0x7E], "[SYNC]")]
    #[case::sync_response(vec![0x02, 0x7D], "[SYNC_RESP]")]
    #[case::config(vec![0x03, 0xFC, 0x11], "[CONFIG [sliding-window-size:1 out-of-frame:0 data-integrity-check-type:1 version-number:0]]")]
    #[case::wakeup(vec![0x05, 0xFA], "[WAKEUP]")]
    #[case::woken(vec![0x06, 0xF9], "[WOKEN]")]
    #[case::sleep(vec![0x07, 0x78], "[SLEEP]")]
    #[case::unknown(vec![0x42, 0x42], "[]")]
    #[case::too_short(vec![0x01], "")]
    fn test_describe_link_control(#[case] payload: Vec<u8>, #[case] expected: &str) {
        assert_eq!(describe_link_control(&payload), expected);
    }

    #[rstest]
    fn test_sync_predicates() {
        assert!(is_sync(&[0x01, 0x7E]));
        assert!(is_sync(&[0x01, 0x7E, 0xFF]));
        assert!(!is_sync(&[0x01]));
        assert!(!is_sync(&[0x02, 0x7D]));
        assert!(is_sync_response(&[0x02, 0x7D]));
        assert!(is_sync_config(&[0x03, 0xFC, 0x00]));
        assert!(is_sync_config_response(&[0x04, 0x7B, 0x11]));
    }
}
