//! Event records published on the bus and persisted to the durable log.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Versioned enumeration of event types.
///
/// Serialized as its dotted wire name (`pipeline.accepted`). Names this build
/// does not know deserialize into [`EventType::Other`] so consumers can skip
/// them instead of failing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    PipelineAccepted,
    PipelineTierClassified,
    PipelineStarted,
    PipelineAgentStarted,
    PipelineAgentStep,
    PipelineAgentCompleted,
    PipelineCompleted,
    PipelineFailed,
    PipelineStopped,
    PipelineError,
    SessionAccepted,
    SessionPlanning,
    SessionPlanReady,
    SessionImplementing,
    SessionImplemented,
    SessionAssistantText,
    SessionToolCall,
    SessionToolResult,
    SessionPrCreated,
    SessionCiRunning,
    SessionReviewRequested,
    SessionCompleted,
    SessionFailed,
    SessionCancelled,
    ReactionTriggered,
    ReactionNotified,
    ReactionEscalated,
    /// An event type this build does not recognise.
    Other(String),
}

impl EventType {
    /// Version of the event-type enumeration.
    pub const SCHEMA_VERSION: u32 = 1;

    /// Wire name of the event type.
    pub fn as_str(&self) -> &str {
        match self {
            EventType::PipelineAccepted => "pipeline.accepted",
            EventType::PipelineTierClassified => "pipeline.tier_classified",
            EventType::PipelineStarted => "pipeline.started",
            EventType::PipelineAgentStarted => "pipeline.agent_started",
            EventType::PipelineAgentStep => "pipeline.agent_step",
            EventType::PipelineAgentCompleted => "pipeline.agent_completed",
            EventType::PipelineCompleted => "pipeline.completed",
            EventType::PipelineFailed => "pipeline.failed",
            EventType::PipelineStopped => "pipeline.stopped",
            EventType::PipelineError => "pipeline.error",
            EventType::SessionAccepted => "session.accepted",
            EventType::SessionPlanning => "session.planning",
            EventType::SessionPlanReady => "session.plan_ready",
            EventType::SessionImplementing => "session.implementing",
            EventType::SessionImplemented => "session.implemented",
            EventType::SessionAssistantText => "session.assistant_text",
            EventType::SessionToolCall => "session.tool_call",
            EventType::SessionToolResult => "session.tool_result",
            EventType::SessionPrCreated => "session.pr_created",
            EventType::SessionCiRunning => "session.ci_running",
            EventType::SessionReviewRequested => "session.review_requested",
            EventType::SessionCompleted => "session.completed",
            EventType::SessionFailed => "session.failed",
            EventType::SessionCancelled => "session.cancelled",
            EventType::ReactionTriggered => "reaction.triggered",
            EventType::ReactionNotified => "reaction.notified",
            EventType::ReactionEscalated => "reaction.escalated",
            EventType::Other(name) => name.as_str(),
        }
    }

    /// Whether this is a type the current build understands.
    pub fn is_known(&self) -> bool {
        !matches!(self, EventType::Other(_))
    }

    /// Terminal pipeline outcomes.
    pub fn is_pipeline_terminal(&self) -> bool {
        matches!(
            self,
            EventType::PipelineCompleted
                | EventType::PipelineFailed
                | EventType::PipelineStopped
                | EventType::PipelineError
        )
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "pipeline.accepted" => EventType::PipelineAccepted,
            "pipeline.tier_classified" => EventType::PipelineTierClassified,
            "pipeline.started" => EventType::PipelineStarted,
            "pipeline.agent_started" => EventType::PipelineAgentStarted,
            "pipeline.agent_step" => EventType::PipelineAgentStep,
            "pipeline.agent_completed" => EventType::PipelineAgentCompleted,
            "pipeline.completed" => EventType::PipelineCompleted,
            "pipeline.failed" => EventType::PipelineFailed,
            "pipeline.stopped" => EventType::PipelineStopped,
            "pipeline.error" => EventType::PipelineError,
            "session.accepted" => EventType::SessionAccepted,
            "session.planning" => EventType::SessionPlanning,
            "session.plan_ready" => EventType::SessionPlanReady,
            "session.implementing" => EventType::SessionImplementing,
            "session.implemented" => EventType::SessionImplemented,
            "session.assistant_text" => EventType::SessionAssistantText,
            "session.tool_call" => EventType::SessionToolCall,
            "session.tool_result" => EventType::SessionToolResult,
            "session.pr_created" => EventType::SessionPrCreated,
            "session.ci_running" => EventType::SessionCiRunning,
            "session.review_requested" => EventType::SessionReviewRequested,
            "session.completed" => EventType::SessionCompleted,
            "session.failed" => EventType::SessionFailed,
            "session.cancelled" => EventType::SessionCancelled,
            "reaction.triggered" => EventType::ReactionTriggered,
            "reaction.notified" => EventType::ReactionNotified,
            "reaction.escalated" => EventType::ReactionEscalated,
            _ => EventType::Other(value),
        }
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        match value {
            EventType::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One published event.
///
/// `request_id` is the correlation id: a pipeline request id or a session id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub event_type: EventType,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl PipelineEvent {
    /// Creates an event stamped with the current time.
    pub fn new(event_type: EventType, request_id: impl Into<String>, data: Value) -> Self {
        Self {
            event_type,
            request_id: request_id.into(),
            timestamp: Utc::now(),
            data,
            metadata: None,
        }
    }

    /// Attaches metadata.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}
