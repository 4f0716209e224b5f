//! Stream client and reconnect supervisor.
//!
//! The client spawns a background worker that owns the whole reconnection
//! lifecycle: it runs one session at a time, applies capped exponential
//! backoff between attempts, and drives the connectivity state machine. The
//! worker publishes to two bounded sinks (connectivity transitions and
//! decoded events) and never blocks on either; when a sink is saturated
//! the newest item is dropped. Both sinks close when the worker exits.

use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::retry::StreamBackoff;
use crate::stream::proto::{ConnectionState, StreamEvent};
use crate::stream::session::{SessionEnd, StreamSession};
use crate::tls;

const DEFAULT_MAX_RETRIES: usize = 10;
const DEFAULT_STATE_CAPACITY: usize = 8;
const DEFAULT_EVENT_CAPACITY: usize = 10;

/// Errors produced by stream transport and handshake handling.
///
/// These never surface to the caller after the supervisor starts; they are
/// logged and folded into connectivity transitions. Only client
/// construction returns one synchronously.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Network-level failure while connecting or reading.
    #[error("stream transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Server refused the stream with a non-2xx response.
    #[error("stream handshake failed with status {status}")]
    Handshake {
        /// Status the server answered the handshake with.
        status: StatusCode,
    },
}

/// Tunables for the reconnect supervisor.
#[derive(Clone, Debug)]
pub struct StreamOptions {
    /// Reconnection attempts before giving up for one supervisor run.
    pub max_retries: usize,
    /// Backoff curve between attempts.
    pub backoff: StreamBackoff,
    /// Connectivity sink capacity.
    pub state_capacity: usize,
    /// Event sink capacity.
    pub event_capacity: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: StreamBackoff::default(),
            state_capacity: DEFAULT_STATE_CAPACITY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Client for the realtime status stream.
pub struct StreamClient {
    http: Client,
    base_url: String,
    api_key: Option<SecretString>,
    options: StreamOptions,
}

impl StreamClient {
    /// Creates a stream client over its own transport.
    ///
    /// The transport trusts the locally issued proxy CA in addition to the
    /// system store (see [`crate::tls`]).
    pub fn new(base_url: impl Into<String>) -> Result<Self, StreamError> {
        Ok(Self::with_http(tls::build_http_client()?, base_url))
    }

    /// Creates a stream client over an existing transport.
    ///
    /// Use this to share one connection pool between the stream supervisor
    /// and an [`crate::api::ApiClient`].
    pub fn with_http(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http,
            base_url,
            api_key: None,
            options: StreamOptions::default(),
        }
    }

    /// Sets the API key passed as the `apikey` query parameter.
    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }

    /// Overrides the supervisor tunables.
    pub fn with_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    /// Starts the reconnect supervisor on a background task.
    ///
    /// Consumes the client so at most one supervisor, and therefore at most
    /// one live session, exists per client instance. The returned handle
    /// carries the two outbound sinks; both close once the supervisor task
    /// has fully exited.
    pub fn spawn(self) -> StreamHandle {
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = mpsc::channel(self.options.state_capacity.max(1));
        let (event_tx, event_rx) = mpsc::channel(self.options.event_capacity.max(1));

        let url = self.events_url();
        let task = tokio::spawn(reconnect_worker(
            self.http,
            url,
            self.options,
            event_tx,
            state_tx,
            cancel.clone(),
        ));

        StreamHandle {
            cancel,
            task,
            states: state_rx,
            events: event_rx,
        }
    }

    fn events_url(&self) -> String {
        let mut url = format!("{}/events", self.base_url);
        if let Some(api_key) = self.api_key.as_ref() {
            url.push_str("?apikey=");
            url.push_str(api_key.expose_secret());
        }
        url
    }
}

/// Cancellation handle detached from the sink receivers.
#[derive(Clone, Debug)]
pub struct StreamStop {
    cancel: CancellationToken,
}

impl StreamStop {
    /// Stops the supervisor. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Handles to a running stream supervisor.
///
/// Dropping the handle without stopping leaves the supervisor running
/// detached until its retry ceiling is reached.
#[derive(Debug)]
pub struct StreamHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    states: mpsc::Receiver<ConnectionState>,
    events: mpsc::Receiver<StreamEvent>,
}

impl StreamHandle {
    /// Receives the next connectivity transition.
    ///
    /// Returns `None` once the supervisor has exited and the sink drained.
    pub async fn next_state(&mut self) -> Option<ConnectionState> {
        self.states.recv().await
    }

    /// Receives the next decoded stream event.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Requests the supervisor to stop. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns a cloneable stop handle.
    pub fn stopper(&self) -> StreamStop {
        StreamStop {
            cancel: self.cancel.clone(),
        }
    }

    /// Splits into a stop handle and the two sink receivers.
    pub fn split(
        self,
    ) -> (
        StreamStop,
        mpsc::Receiver<ConnectionState>,
        mpsc::Receiver<StreamEvent>,
    ) {
        (
            StreamStop {
                cancel: self.cancel,
            },
            self.states,
            self.events,
        )
    }

    /// Stops the supervisor and waits for the task to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Delivers a connectivity update without blocking the supervisor.
///
/// The sink is lossy by design: when the consumer is saturated the newest
/// update is dropped rather than stalling the producer.
pub(crate) fn publish_state(states: &mpsc::Sender<ConnectionState>, state: ConnectionState) {
    if states.try_send(state).is_err() {
        debug!(event = "state_sink_full", state = ?state);
    }
}

async fn reconnect_worker(
    http: Client,
    url: String,
    options: StreamOptions,
    events: mpsc::Sender<StreamEvent>,
    states: mpsc::Sender<ConnectionState>,
    cancel: CancellationToken,
) {
    let mut attempt: usize = 0;

    loop {
        if cancel.is_cancelled() {
            publish_state(&states, ConnectionState::Disconnected);
            return;
        }

        attempt += 1;

        if attempt > 1 {
            let delay = options.backoff.delay_for_attempt(attempt);
            info!(
                event = "stream_reconnect_wait",
                attempt,
                max_retries = options.max_retries,
                delay_ms = delay.as_millis() as u64,
            );
            tokio::select! {
                () = cancel.cancelled() => {
                    publish_state(&states, ConnectionState::Disconnected);
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }
        }

        if attempt > options.max_retries {
            error!(
                event = "stream_retries_exhausted",
                attempts = attempt - 1,
                max_retries = options.max_retries,
            );
            publish_state(&states, ConnectionState::Disconnected);
            return;
        }

        publish_state(&states, ConnectionState::Connecting);

        let session = StreamSession {
            http: &http,
            url: &url,
            events: &events,
            states: &states,
            cancel: &cancel,
        };

        match session.run().await {
            SessionEnd::Cancelled => {
                publish_state(&states, ConnectionState::Disconnected);
                return;
            }
            SessionEnd::Held => {
                if attempt > 1 {
                    info!(event = "stream_connection_recovered", after_attempts = attempt);
                }
                // Only a session that connected and held resets the retry
                // clock; a handshake whose read fails does not.
                attempt = 0;
                publish_state(&states, ConnectionState::Reconnecting);
            }
            SessionEnd::Failed(failure) => {
                warn!(
                    event = "stream_session_failed",
                    attempt,
                    max_retries = options.max_retries,
                    error = %failure,
                );
                if cancel.is_cancelled() {
                    publish_state(&states, ConnectionState::Disconnected);
                    return;
                }
                publish_state(&states, ConnectionState::Reconnecting);
            }
        }
    }
}
