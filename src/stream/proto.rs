//! Status stream wire types and server-push framing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event-type label the stream currently decodes.
pub(crate) const STATUS_EVENT: &str = "status";

/// Connectivity of the stream supervisor, published to the state sink.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    /// No session and no further attempts; terminal for one supervisor run.
    Disconnected,
    /// An attempt is about to open the streaming connection.
    Connecting,
    /// The server accepted the stream; frames are being read.
    Connected,
    /// The session ended and another attempt will follow.
    Reconnecting,
}

/// Status snapshot pushed by the proxy on the events stream.
///
/// Fields the proxy omits decode to their zero values; consumers must treat
/// an empty map or address as "not reported", not as an error.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusUpdate {
    /// Whether the proxy core is running.
    #[serde(default)]
    pub running: bool,
    /// Address the proxy is listening on.
    #[serde(default)]
    pub listen_addr: String,
    /// Per-upstream metrics, keyed by upstream name.
    #[serde(default)]
    pub upstream_stats: BTreeMap<String, Value>,
    /// Free-form status details.
    #[serde(default)]
    pub status: BTreeMap<String, Value>,
    /// Server-side timestamp of the snapshot.
    #[serde(default)]
    pub timestamp: i64,
}

/// Decoded event published to the event sink.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// Periodic status snapshot (`event: status`).
    Status(StatusUpdate),
}

/// One completed unit of the server-push wire format.
#[derive(Debug)]
pub(crate) struct Frame {
    /// Trimmed event-type label.
    pub event_type: String,
    /// Data lines joined with a single newline, in arrival order.
    pub data: String,
}

/// Incremental parser for the line-oriented server-push framing.
///
/// Feed one line at a time. A blank line closes the frame and yields the
/// accumulated label and payload, but only once both are non-empty; a
/// partial accumulation survives the boundary. Lines with an unknown prefix
/// are ignored.
#[derive(Debug, Default)]
pub(crate) struct FrameParser {
    event_type: String,
    data: String,
}

impl FrameParser {
    pub(crate) fn push_line(&mut self, line: &str) -> Option<Frame> {
        if line.is_empty() {
            if self.event_type.is_empty() || self.data.is_empty() {
                return None;
            }
            return Some(Frame {
                event_type: std::mem::take(&mut self.event_type),
                data: std::mem::take(&mut self.data),
            });
        }

        if let Some(rest) = line.strip_prefix("event:") {
            self.event_type = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("data:") {
            if !self.data.is_empty() {
                self.data.push('\n');
            }
            self.data.push_str(rest.trim());
        }

        None
    }
}

/// Decodes a completed frame into a stream event.
///
/// Unrecognized labels yield `Ok(None)` so new server-side event types do
/// not break older clients. A malformed payload for a recognized label is an
/// error the caller logs and drops without ending the session.
pub(crate) fn decode_frame(frame: &Frame) -> Result<Option<StreamEvent>, serde_json::Error> {
    if frame.event_type != STATUS_EVENT {
        return Ok(None);
    }

    let update: StatusUpdate = serde_json::from_str(&frame.data)?;
    Ok(Some(StreamEvent::Status(update)))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{decode_frame, FrameParser, StatusUpdate, StreamEvent};

    fn feed(parser: &mut FrameParser, lines: &[&str]) -> Vec<super::Frame> {
        lines
            .iter()
            .filter_map(|line| parser.push_line(line))
            .collect()
    }

    #[test]
    fn parser_joins_data_lines_with_newline_in_order() {
        let mut parser = FrameParser::default();

        let frames = feed(
            &mut parser,
            &["event: status", "data: {\"running\":", "data: true}", ""],
        );

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event_type, "status");
        assert_eq!(frames[0].data, "{\"running\":\ntrue}");
    }

    #[test]
    fn parser_resets_after_dispatch() {
        let mut parser = FrameParser::default();

        let frames = feed(
            &mut parser,
            &[
                "event: status",
                "data: {}",
                "",
                "event: status",
                "data: {\"running\":true}",
                "",
            ],
        );

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].data, "{\"running\":true}");
    }

    #[test]
    fn blank_line_without_full_frame_keeps_accumulators() {
        let mut parser = FrameParser::default();

        let frames = feed(&mut parser, &["event: status", "", "data: {}", ""]);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event_type, "status");
        assert_eq!(frames[0].data, "{}");
    }

    #[test]
    fn parser_ignores_unknown_lines() {
        let mut parser = FrameParser::default();

        let frames = feed(
            &mut parser,
            &[": keep-alive", "id: 7", "event: status", "data: {}", ""],
        );

        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn unrecognized_event_labels_are_dropped() {
        let mut parser = FrameParser::default();

        let frames = feed(&mut parser, &["event: heartbeat", "data: {}", ""]);
        assert_eq!(frames.len(), 1);
        assert_eq!(decode_frame(&frames[0]).expect("decode"), None);
    }

    #[test]
    fn split_status_payload_rejoins_and_decodes() {
        let mut parser = FrameParser::default();

        let frames = feed(
            &mut parser,
            &["event: status", "data: {\"running\":", "data: true}", ""],
        );
        let event = decode_frame(&frames[0]).expect("decode").expect("status");
        let StreamEvent::Status(update) = event;
        assert!(update.running);
    }

    #[test]
    fn malformed_status_payload_is_an_error() {
        let mut parser = FrameParser::default();

        let frames = feed(&mut parser, &["event: status", "data: not-json", ""]);
        assert!(decode_frame(&frames[0]).is_err());
    }

    #[test]
    fn status_decode_tolerates_missing_fields() {
        let update: StatusUpdate = serde_json::from_str("{}").expect("decode empty");
        assert_eq!(update, StatusUpdate::default());

        let update: StatusUpdate =
            serde_json::from_str(r#"{"running":true,"timestamp":1700000000}"#).expect("decode");
        assert!(update.running);
        assert_eq!(update.timestamp, 1_700_000_000);
        assert!(update.listen_addr.is_empty());
        assert!(update.upstream_stats.is_empty());
    }

    #[test]
    fn status_frame_decodes_full_payload() {
        let payload = json!({
            "running": true,
            "listen_addr": "127.0.0.1:8080",
            "upstream_stats": {"fs": {"connected": true}},
            "status": {"phase": "serving"},
            "timestamp": 1700000123,
        });
        let mut parser = FrameParser::default();
        let frames = feed(
            &mut parser,
            &["event: status", &format!("data: {payload}"), ""],
        );

        let event = decode_frame(&frames[0]).expect("decode").expect("status");
        let StreamEvent::Status(update) = event;
        assert!(update.running);
        assert_eq!(update.listen_addr, "127.0.0.1:8080");
        assert_eq!(
            update.upstream_stats.get("fs"),
            Some(&json!({"connected": true}))
        );
        assert_eq!(update.timestamp, 1_700_000_123);
    }
}
