//! Single streaming session against the events endpoint.
//!
//! A session performs one streaming GET, parses server-push frames, and
//! forwards decoded events to the event sink. It runs until the server
//! refuses the connection, drops it, or the caller cancels. State
//! transitions around the session belong to the reconnect supervisor; the
//! session itself only emits `Connected` after a successful handshake.

use futures_util::StreamExt;
use reqwest::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::stream::client::{publish_state, StreamError};
use crate::stream::proto::{decode_frame, ConnectionState, Frame, FrameParser, StreamEvent};

/// How a session ended, as observed by the reconnect supervisor.
#[derive(Debug)]
pub(crate) enum SessionEnd {
    /// Handshake succeeded and the server later closed the stream cleanly.
    Held,
    /// Cancellation was observed at a suspension point.
    Cancelled,
    /// Handshake was refused or the connection failed.
    Failed(StreamError),
}

/// Borrowed context for one session run.
pub(crate) struct StreamSession<'a> {
    pub http: &'a Client,
    pub url: &'a str,
    pub events: &'a mpsc::Sender<StreamEvent>,
    pub states: &'a mpsc::Sender<ConnectionState>,
    pub cancel: &'a CancellationToken,
}

impl StreamSession<'_> {
    /// Runs the session to completion.
    ///
    /// Every blocking point races against the cancellation token; dropping
    /// the in-flight response aborts the underlying connection, so a
    /// cancelled read never waits for peer timeout.
    pub(crate) async fn run(&self) -> SessionEnd {
        let request = self
            .http
            .get(self.url)
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache");

        let response = tokio::select! {
            () = self.cancel.cancelled() => return SessionEnd::Cancelled,
            result = request.send() => match result {
                Ok(response) => response,
                Err(error) => return SessionEnd::Failed(StreamError::Transport(error)),
            },
        };

        let status = response.status();
        if !status.is_success() {
            return SessionEnd::Failed(StreamError::Handshake { status });
        }

        publish_state(self.states, ConnectionState::Connected);

        let mut body = response.bytes_stream();
        let mut lines = LineBuffer::default();
        let mut parser = FrameParser::default();

        loop {
            let chunk = tokio::select! {
                () = self.cancel.cancelled() => return SessionEnd::Cancelled,
                chunk = body.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    for line in lines.split_lines(&bytes) {
                        if let Some(frame) = parser.push_line(&line) {
                            self.dispatch(&frame);
                        }
                    }
                }
                Some(Err(error)) => return SessionEnd::Failed(StreamError::Transport(error)),
                None => return SessionEnd::Held,
            }
        }
    }

    fn dispatch(&self, frame: &Frame) {
        match decode_frame(frame) {
            Ok(Some(event)) => {
                // Best-effort: drop when the event sink is backpressured.
                if self.events.try_send(event).is_err() {
                    debug!(event = "event_sink_full", "dropping status update");
                }
            }
            Ok(None) => {
                debug!(
                    event = "unknown_stream_event",
                    label = frame.event_type.as_str(),
                );
            }
            Err(error) => {
                warn!(event = "status_decode_failed", error = %error);
            }
        }
    }
}

/// Splits a byte stream into lines, buffering a partial trailing line.
///
/// Lines are yielded without their terminator; a trailing carriage return is
/// stripped so CRLF streams parse identically.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn split_lines(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut out = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            out.push(String::from_utf8_lossy(&line).into_owned());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::LineBuffer;

    #[test]
    fn reassembles_lines_across_chunks() {
        let mut buffer = LineBuffer::default();

        assert!(buffer.split_lines(b"event: st").is_empty());
        assert_eq!(
            buffer.split_lines(b"atus\ndata: {}\n\n"),
            vec!["event: status", "data: {}", ""],
        );
    }

    #[test]
    fn strips_carriage_returns() {
        let mut buffer = LineBuffer::default();

        assert_eq!(
            buffer.split_lines(b"event: status\r\ndata: {}\r\n"),
            vec!["event: status", "data: {}"],
        );
    }

    #[test]
    fn keeps_partial_trailing_line_pending() {
        let mut buffer = LineBuffer::default();

        assert_eq!(buffer.split_lines(b"data: a\ndata: b"), vec!["data: a"]);
        assert_eq!(buffer.split_lines(b"\n"), vec!["data: b"]);
    }
}
