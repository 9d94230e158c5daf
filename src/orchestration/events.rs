//! Lifecycle events and the sinks that receive them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::log;

pub const EXECUTION_STARTED: &str = "execution:started";
pub const EXECUTION_HALTED: &str = "execution:halted";
pub const EXECUTION_RESUMED: &str = "execution:resumed";
pub const EXECUTION_COMPLETED: &str = "execution:completed";
pub const EXECUTION_FAILED: &str = "execution:failed";
pub const EXECUTION_ROLLBACK_STARTED: &str = "execution:rollback_started";
pub const EXECUTION_ROLLBACK_COMPLETED: &str = "execution:rollback_completed";
pub const EXECUTION_ROLLBACK_FAILED: &str = "execution:rollback_failed";
pub const SKILL_STARTED: &str = "skill:started";
pub const SKILL_COMPLETED: &str = "skill:completed";
pub const SKILL_FAILED: &str = "skill:failed";
pub const SKILL_SKIPPED: &str = "skill:skipped";
pub const SKILL_RETRYING: &str = "skill:retrying";
pub const CHECKPOINT_CREATED: &str = "checkpoint:created";
pub const DECISION_PRESENTED: &str = "decision:presented";
pub const DECISION_RESOLVED: &str = "decision:resolved";

/// A lifecycle event as delivered to channel subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Receiver of orchestrator lifecycle events.
///
/// Emission is best-effort: the orchestrator bounds each call with a
/// timeout and only logs failures. A failing `init` stops the run.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn emit(&self, event_type: &str, data: serde_json::Value) -> Result<()>;
}

/// Forwards events into an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn from_sender(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn emit(&self, event_type: &str, data: serde_json::Value) -> Result<()> {
        self.tx
            .send(Event::new(event_type, data))
            .map_err(|_| Error::EventSink("event receiver dropped".to_string()))
    }
}

/// Writes events to the conductor log as `event=<type> key=value` lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEventSink;

#[async_trait]
impl EventSink for LogEventSink {
    async fn emit(&self, event_type: &str, data: serde_json::Value) -> Result<()> {
        log::event(event_type, &data);
        Ok(())
    }
}
