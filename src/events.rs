//! Typed streaming events emitted during a conversation turn
//!
//! Each turn produces a strictly ordered sequence of events over a single
//! writer. Exactly one of `FinalAnswer` or `Error` terminates the turn.

use serde::{Deserialize, Serialize};

/// An event in the per-turn stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Incremental response text; consumers concatenate deltas
    TokenDelta { text: String },

    /// A tool invocation was dispatched
    ToolCallStart { tool: String, call_id: String },

    /// A tool invocation completed (possibly with an error payload)
    ToolCallResult {
        tool: String,
        call_id: String,
        is_error: bool,
        summary: String,
    },

    /// Planner reasoning surfaced to the client
    PlannerThought { text: String },

    /// Terminal event: the complete answer with citations
    FinalAnswer {
        text: String,
        citations: Vec<Citation>,
        cached: bool,
    },

    /// Terminal event: the turn failed
    Error { message: String },
}

impl AgentEvent {
    /// Whether this event terminates the turn
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::FinalAnswer { .. } | AgentEvent::Error { .. })
    }
}

/// A source citation attached to an answer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    pub document_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    pub page: u32,
}

/// Single-writer event emitter for one conversation turn.
///
/// Enforces the terminal-event contract: nothing can be emitted after a
/// `FinalAnswer` or `Error`, and dropping the emitter without a terminal
/// event leaves the stream visibly incomplete to readers.
pub struct EventEmitter {
    tx: flume::Sender<AgentEvent>,
    terminated: bool,
}

impl EventEmitter {
    /// Create an emitter and its receiving half
    pub fn channel() -> (Self, flume::Receiver<AgentEvent>) {
        let (tx, rx) = flume::unbounded();
        (
            Self {
                tx,
                terminated: false,
            },
            rx,
        )
    }

    /// Emit an event. Events after the terminal event are dropped.
    pub fn emit(&mut self, event: AgentEvent) {
        if self.terminated {
            return;
        }
        if event.is_terminal() {
            self.terminated = true;
        }
        // A disconnected receiver just means the client went away.
        let _ = self.tx.send(event);
    }

    /// Whether a terminal event has been emitted
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_events() {
        assert!(AgentEvent::FinalAnswer {
            text: "done".to_string(),
            citations: vec![],
            cached: false,
        }
        .is_terminal());
        assert!(AgentEvent::Error {
            message: "failed".to_string()
        }
        .is_terminal());
        assert!(!AgentEvent::TokenDelta {
            text: "a".to_string()
        }
        .is_terminal());
    }

    #[test]
    fn test_emitter_stops_after_terminal() {
        let (mut emitter, rx) = EventEmitter::channel();

        emitter.emit(AgentEvent::TokenDelta {
            text: "hello".to_string(),
        });
        emitter.emit(AgentEvent::FinalAnswer {
            text: "hello world".to_string(),
            citations: vec![],
            cached: false,
        });
        emitter.emit(AgentEvent::TokenDelta {
            text: "late".to_string(),
        });

        let events: Vec<AgentEvent> = rx.drain().collect();
        assert_eq!(events.len(), 2);
        assert!(events[1].is_terminal());
    }

    #[test]
    fn test_event_serialization() {
        let event = AgentEvent::ToolCallStart {
            tool: "sql_query".to_string(),
            call_id: "call-0".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"tool_call_start\""));

        let parsed: AgentEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
