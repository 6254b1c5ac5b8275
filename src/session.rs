// ABOUTME: Execution session turning a kernel's raw event channel into NDJSON output lines
// ABOUTME: Ends on the idle status or on the first channel fault; always closes the channel once

use std::sync::Arc;

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::pool::KernelHandle;
use crate::runtime::{EventChannel, KernelEvent};

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Draining,
    Done,
    Failed,
}

impl SessionState {
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Draining)
    }
}

/// One event forwarded to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputEvent {
    pub msg_type: String,
    pub content: serde_json::Value,
}

impl OutputEvent {
    /// The terminal event reporting a channel fault
    pub fn error(description: impl Into<String>) -> Self {
        Self {
            msg_type: "error".to_string(),
            content: serde_json::Value::String(description.into()),
        }
    }

    /// Serialize as one newline-terminated JSON line
    pub fn to_line(&self) -> String {
        // Serializing a String key and a Value cannot fail
        let mut line = serde_json::to_string(self).unwrap_or_default();
        line.push('\n');
        line
    }
}

/// What to do with one raw kernel event
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Non-idle status; keep draining
    Skip,
    /// Forward this event
    Emit(OutputEvent),
    /// Idle status; the execution is over
    Finish,
}

/// Map a raw event to the session's next step
pub fn classify(event: KernelEvent) -> Step {
    match event.kind.as_str() {
        "status" => {
            if event.execution_state() == Some("idle") {
                Step::Finish
            } else {
                Step::Skip
            }
        }
        // Drop the echoed source, keep only the counter
        "execute_input" => Step::Emit(OutputEvent {
            msg_type: event.kind,
            content: serde_json::json!({
                "execution_count": event.payload.get("execution_count").cloned().unwrap_or_default(),
            }),
        }),
        _ => Step::Emit(OutputEvent {
            msg_type: event.kind,
            content: event.payload,
        }),
    }
}

/// Owns the channel and closes it exactly once, on whichever path ends first
struct ChannelGuard {
    channel: Box<dyn EventChannel>,
    closed: bool,
}

impl ChannelGuard {
    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.channel.close();
        }
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        if !self.closed {
            debug!("Execution stream dropped before completion, releasing channel");
        }
        self.close();
    }
}

/// Drains one execution's events from a kernel channel
pub struct ExecutionSession {
    channel: ChannelGuard,
    state: SessionState,
    /// Touched on every received event so a long execution is not evicted
    activity: Option<Arc<KernelHandle>>,
}

impl ExecutionSession {
    pub fn new(channel: Box<dyn EventChannel>) -> Self {
        Self {
            channel: ChannelGuard {
                channel,
                closed: false,
            },
            state: SessionState::Draining,
            activity: None,
        }
    }

    /// Keep `handle`'s activity time fresh while events flow
    #[must_use]
    pub fn with_activity(mut self, handle: Arc<KernelHandle>) -> Self {
        self.activity = Some(handle);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Next event to forward, or `None` once the session is over
    pub async fn next_event(&mut self) -> Option<OutputEvent> {
        while !self.state.is_terminal() {
            let raw = match self.channel.channel.next_event().await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(error = %e, "Execution channel fault");
                    self.finish(SessionState::Failed);
                    return Some(OutputEvent::error(e.to_string()));
                }
            };

            if let Some(handle) = &self.activity {
                handle.touch();
            }
            debug!(msg_type = %raw.kind, "Execution event");

            match classify(raw) {
                Step::Skip => {}
                Step::Emit(event) => return Some(event),
                Step::Finish => self.finish(SessionState::Done),
            }
        }
        None
    }

    /// Next NDJSON line, or `None` once the session is over
    pub async fn next_line(&mut self) -> Option<String> {
        self.next_event().await.map(|event| event.to_line())
    }

    /// The session as a stream of NDJSON lines
    ///
    /// Dropping the stream early releases the channel.
    pub fn into_stream(self) -> impl Stream<Item = String> + Send {
        let mut session = self;
        async_stream::stream! {
            while let Some(line) = session.next_line().await {
                yield line;
            }
        }
    }

    fn finish(&mut self, state: SessionState) {
        self.state = state;
        self.channel.close();
    }
}
