//! Live change-stream subscription.
//!
//! The public event stream is consumed as a long-lived SSE response: bytes
//! are line-buffered, `data:` frames carry one JSON payload each, and the
//! payload's `meta.stream` names the topic. Connection state is published
//! through a watch channel so the revision store can gate writes on the
//! stream being open; the consumer reconnects with a fixed backoff until
//! stopped.

use futures::StreamExt;
use std::sync::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::models::VisibilityFlags;

const EVENTSTREAMS_BASE: &str = "https://stream.wikimedia.org/v2/stream/";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Lifecycle of the stream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Closed,
    Connecting,
    Open,
}

/// Topics the store can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    VisibilityChange,
    TagsChange,
}

impl Topic {
    pub fn stream_name(self) -> &'static str {
        match self {
            Topic::VisibilityChange => "mediawiki.revision-visibility-change",
            Topic::TagsChange => "mediawiki.revision-tags-change",
        }
    }
}

/// A decoded event relevant to the revision store.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    /// Revision fields were hidden or unhidden; `hidden` carries the new
    /// hidden-flags.
    VisibilityChange {
        wiki: String,
        revid: u64,
        hidden: VisibilityFlags,
    },
    /// The authoritative tag set for a revision changed.
    TagsChange {
        wiki: String,
        revid: u64,
        tags: Vec<String>,
    },
}

/// Long-lived SSE consumer with reconnect.
pub struct ChangeStream {
    endpoint: String,
    state_tx: watch::Sender<StreamState>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeStream {
    pub fn new(topics: &[Topic]) -> Self {
        let names: Vec<&str> = topics.iter().map(|topic| topic.stream_name()).collect();
        let (state_tx, _) = watch::channel(StreamState::Closed);
        Self {
            endpoint: format!("{EVENTSTREAMS_BASE}{}", names.join(",")),
            state_tx,
            handle: Mutex::new(None),
        }
    }

    /// Current-state receiver for write gating.
    pub fn state(&self) -> watch::Receiver<StreamState> {
        self.state_tx.subscribe()
    }

    /// Starts the consumer, delivering events into `events`. Idempotent:
    /// starting an already Connecting or Open stream is a no-op.
    pub fn start(&self, events: mpsc::Sender<ChangeEvent>) {
        let mut handle = self.handle.lock().unwrap();
        if *self.state_tx.borrow() != StreamState::Closed {
            return;
        }
        let _ = self.state_tx.send(StreamState::Connecting);

        let endpoint = self.endpoint.clone();
        let state_tx = self.state_tx.clone();
        *handle = Some(tokio::spawn(async move {
            run_consumer(endpoint, state_tx, events).await;
        }));
    }

    /// Stops the consumer; subsequent store writes degrade to no-ops until
    /// a restart.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
        let _ = self.state_tx.send(StreamState::Closed);
    }
}

async fn run_consumer(
    endpoint: String,
    state_tx: watch::Sender<StreamState>,
    events: mpsc::Sender<ChangeEvent>,
) {
    let client = match reqwest::Client::builder()
        .user_agent(crate::clients::USER_AGENT)
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            tracing::error!(error = %err, "change stream client construction failed");
            let _ = state_tx.send(StreamState::Closed);
            return;
        }
    };

    loop {
        let _ = state_tx.send(StreamState::Connecting);
        let response = match client.get(&endpoint).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                tracing::warn!(status = %response.status(), "change stream rejected connection");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
            Err(err) => {
                tracing::warn!(error = %err, "change stream connection failed");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };

        let _ = state_tx.send(StreamState::Open);
        tracing::info!("change stream open");

        let mut frames = SseFrames::default();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    for payload in frames.push(&String::from_utf8_lossy(&bytes)) {
                        if let Some(event) = parse_event_payload(&payload) {
                            if events.send(event).await.is_err() {
                                // Receiver gone: the store was dropped.
                                let _ = state_tx.send(StreamState::Closed);
                                return;
                            }
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "change stream read error");
                    break;
                }
            }
        }

        tracing::info!("change stream disconnected; reconnecting");
    }
}

/// Line-buffering SSE frame splitter: feed raw chunks, get completed
/// `data:` payloads back. Multi-line data within one event is joined with
/// newlines, per the SSE framing rules.
#[derive(Default)]
pub struct SseFrames {
    buffer: String,
    data_lines: Vec<String>,
}

impl SseFrames {
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut payloads = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    payloads.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
            } else if let Some(data) = line.strip_prefix("data:") {
                self.data_lines.push(data.trim_start().to_string());
            }
            // `event:`, `id:`, and comment lines are not needed here.
        }

        payloads
    }
}

/// Decodes one event payload. The stream reports which fields are
/// *visible*; the store works with hidden-flags, so the booleans invert
/// here.
pub fn parse_event_payload(payload: &str) -> Option<ChangeEvent> {
    let body: serde_json::Value = serde_json::from_str(payload).ok()?;
    let stream = body["meta"]["stream"].as_str()?;
    let wiki = body["database"].as_str()?.to_string();
    let revid = body["rev_id"].as_u64()?;

    if stream == Topic::VisibilityChange.stream_name() {
        let visibility = &body["visibility"];
        Some(ChangeEvent::VisibilityChange {
            wiki,
            revid,
            hidden: VisibilityFlags {
                user: !visibility["user"].as_bool().unwrap_or(true),
                comment: !visibility["comment"].as_bool().unwrap_or(true),
                text: !visibility["text"].as_bool().unwrap_or(true),
            },
        })
    } else if stream == Topic::TagsChange.stream_name() {
        Some(ChangeEvent::TagsChange {
            wiki,
            revid,
            tags: body["tags"]
                .as_array()?
                .iter()
                .filter_map(|tag| tag.as_str())
                .map(|tag| tag.to_string())
                .collect(),
        })
    } else {
        None
    }
}
