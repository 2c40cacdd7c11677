//! Framing: one JSON object per line. Lines that are not a known frame are kept as plain text.

use crate::protocol::Frame;

/// Longest line accepted from a peer, newline excluded.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Encode a frame as a single line, trailing newline included.
pub fn encode_line(frame: &Frame) -> Result<String, WireError> {
    let mut line = serde_json::to_string(frame).map_err(WireError::Encode)?;
    if line.len() > MAX_LINE_LEN {
        return Err(WireError::TooLarge);
    }
    line.push('\n');
    Ok(line)
}

/// What arrived on one line.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Frame(Frame),
    /// Not JSON, or JSON that is not a known frame. Never rejected; handled as a text message.
    PlainText(String),
}

/// Decode one line (with or without its trailing newline). Blank lines yield None.
pub fn decode_line(line: &str) -> Option<Inbound> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<Frame>(trimmed) {
        Ok(frame) => Some(Inbound::Frame(frame)),
        Err(_) => Some(Inbound::PlainText(trimmed.to_string())),
    }
}

/// Error encoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("frame too large")]
    TooLarge,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Handshake, PROTOCOL_VERSION};

    fn sample_handshake() -> Frame {
        Frame::Handshake(Handshake {
            device_id: "5f0c".into(),
            mac_address: "aa:bb:cc:dd:ee:ff".into(),
            user_name: "ana".into(),
            device_name: "pixel".into(),
            timestamp: 1_700_000_000_000,
            protocol_version: PROTOCOL_VERSION.into(),
        })
    }

    #[test]
    fn encoded_frame_is_one_line() {
        let line = encode_line(&sample_handshake()).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        assert_eq!(decode_line(&line), Some(Inbound::Frame(sample_handshake())));
    }

    #[test]
    fn heartbeat_shape() {
        let line = encode_line(&Frame::Heartbeat { timestamp: 5 }).unwrap();
        assert_eq!(line, "{\"type\":\"heartbeat\",\"timestamp\":5}\n");
    }

    #[test]
    fn non_json_is_plain_text() {
        assert_eq!(
            decode_line("hello there\r\n"),
            Some(Inbound::PlainText("hello there".into()))
        );
    }

    #[test]
    fn unknown_frame_type_is_plain_text() {
        let raw = r#"{"type":"telemetry","value":1}"#;
        assert_eq!(decode_line(raw), Some(Inbound::PlainText(raw.into())));
    }

    #[test]
    fn bare_heartbeat_is_a_frame() {
        assert_eq!(
            decode_line(r#"{"type":"heartbeat"}"#),
            Some(Inbound::Frame(Frame::Heartbeat { timestamp: 0 }))
        );
    }

    #[test]
    fn out_of_range_ttl_is_clamped() {
        let msg = |ttl: &str| {
            format!(r#"{{"type":"message","messageId":"m","message":"x","deviceId":"d","ttl":{ttl}}}"#)
        };
        let ttl_of = |line: String| match decode_line(&line) {
            Some(Inbound::Frame(Frame::Message(m))) => m.ttl,
            other => panic!("expected a message frame, got {other:?}"),
        };
        assert_eq!(ttl_of(msg("1000")), 255);
        assert_eq!(ttl_of(msg("-4")), 0);
        assert_eq!(ttl_of(msg("null")), crate::protocol::DEFAULT_TTL);
        assert_eq!(ttl_of(msg("2")), 2);
    }

    #[test]
    fn blank_line_is_ignored() {
        assert_eq!(decode_line("\n"), None);
        assert_eq!(decode_line("   "), None);
    }
}
