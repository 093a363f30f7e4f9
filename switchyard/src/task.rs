use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::models::OrgId;

/// The closed set of task types dispatched through the shared queues and the
/// per-contact event lists.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    StartFlow,
    StartFlowBatch,
    StartIvrFlowBatch,
    HandleContactEvent,
    StudioFlowStart,
    MsgEvent,
    StopEvent,
    NewConversation,
    Referral,
    MoMiss,
    WelcomeMessage,
    TimeoutEvent,
    ExpirationEvent,
}

impl TaskType {
    /// Get the wire representation of this task type.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::StartFlow => "start_flow",
            TaskType::StartFlowBatch => "start_flow_batch",
            TaskType::StartIvrFlowBatch => "start_ivr_flow_batch",
            TaskType::HandleContactEvent => "handle_contact_event",
            TaskType::StudioFlowStart => "studio_flow_start",
            TaskType::MsgEvent => "msg_event",
            TaskType::StopEvent => "stop_event",
            TaskType::NewConversation => "new_conversation",
            TaskType::Referral => "referral",
            TaskType::MoMiss => "mo_miss",
            TaskType::WelcomeMessage => "welcome_message",
            TaskType::TimeoutEvent => "timeout_event",
            TaskType::ExpirationEvent => "expiration_event",
        }
    }

    /// Whether this type is a contact-level event carried on the per-contact
    /// list rather than dispatched directly from a shared queue.
    pub fn is_contact_event(&self) -> bool {
        matches!(
            self,
            TaskType::MsgEvent
                | TaskType::StopEvent
                | TaskType::NewConversation
                | TaskType::Referral
                | TaskType::MoMiss
                | TaskType::WelcomeMessage
                | TaskType::TimeoutEvent
                | TaskType::ExpirationEvent
        )
    }
}

impl Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority of an enqueued task. `High` jumps the owner ahead in the queue's
/// owner index and inserts the payload at the head of the owner's list.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    High,
    #[default]
    Default,
}

/// A tagged unit of asynchronous work. The payload is opaque to the queue and
/// decoded by the handler registered for the type tag.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub org_id: OrgId,
    pub task: serde_json::Value,
    pub queued_on: DateTime<Utc>,
    #[serde(default)]
    pub error_count: u32,
}

impl Task {
    /// Create a new task, serializing the payload.
    pub fn new<T: Serialize>(
        task_type: TaskType,
        org_id: OrgId,
        payload: &T,
    ) -> anyhow::Result<Task> {
        Ok(Task {
            task_type,
            org_id,
            task: serde_json::to_value(payload)?,
            queued_on: Utc::now(),
            error_count: 0,
        })
    }

    /// Decode the opaque payload into the handler's type.
    pub fn decode<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_value(self.task.clone())
            .map_err(|e| anyhow::anyhow!("error decoding {} payload: {}", self.task_type, e))
    }

    /// Age of this task since it was first queued.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.queued_on
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContactId;

    #[derive(Serialize, Deserialize)]
    struct HandleEventPayload {
        contact_id: ContactId,
    }

    #[test]
    fn test_task_wire_format() {
        let task = Task::new(
            TaskType::HandleContactEvent,
            OrgId(7),
            &HandleEventPayload {
                contact_id: ContactId(42),
            },
        )
        .unwrap();

        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["type"], "handle_contact_event");
        assert_eq!(json["org_id"], 7);
        assert_eq!(json["task"]["contact_id"], 42);
        assert_eq!(json["error_count"], 0);
        assert!(json["queued_on"].is_string());

        let back: Task = serde_json::from_value(json).unwrap();
        let payload: HandleEventPayload = back.decode().unwrap();
        assert_eq!(payload.contact_id, ContactId(42));
    }

    #[test]
    fn test_error_count_defaults_when_absent() {
        let raw = r#"{"type":"msg_event","org_id":1,"task":{},"queued_on":"2024-01-01T00:00:00Z"}"#;
        let task: Task = serde_json::from_str(raw).unwrap();
        assert_eq!(task.error_count, 0);
    }

    #[test]
    fn test_contact_event_classification() {
        assert!(TaskType::MsgEvent.is_contact_event());
        assert!(TaskType::TimeoutEvent.is_contact_event());
        assert!(!TaskType::StartFlow.is_contact_event());
        assert!(!TaskType::HandleContactEvent.is_contact_event());
    }
}
