//! Bridge to the opaque flow engine.
//!
//! The engine consumes a session plus a trigger or resume and produces one
//! sprint. It is pure with respect to persistence: it may call out (webhooks,
//! classifiers) while stepping, but everything it wants persisted comes back
//! as sprint events that the hooks layer applies.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::assets::OrgAssets;
use crate::models::{
    ChannelId, Contact, FlowId, MsgIn, RunOutput, Session, SessionOutput, StartId,
};

/// Options fixed at engine construction, from process config.
#[derive(Clone, Copy, Debug)]
pub struct EngineOptions {
    pub max_steps_per_sprint: usize,
    pub webhook_max_body_bytes: usize,
}

impl EngineOptions {
    pub fn from_config(config: &crate::config::Config) -> EngineOptions {
        EngineOptions {
            max_steps_per_sprint: config.max_steps_per_sprint,
            webhook_max_body_bytes: config.webhook_max_body_bytes,
        }
    }
}

/// What kicks off a new session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowTrigger {
    /// An inbound message matched a trigger.
    Msg {
        flow_id: FlowId,
        msg: MsgIn,
        #[serde(skip_serializing_if = "Option::is_none")]
        keyword_match: Option<String>,
    },
    /// A channel event (new conversation, referral, missed call) matched a
    /// trigger.
    Channel {
        flow_id: FlowId,
        channel_id: ChannelId,
        event_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    /// An incoming voice call matched a trigger.
    IncomingCall {
        flow_id: FlowId,
        channel_id: ChannelId,
        urn: String,
    },
    /// A flow start reached this contact.
    Start {
        flow_id: FlowId,
        #[serde(skip_serializing_if = "Option::is_none")]
        start_id: Option<StartId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_summary: Option<Value>,
    },
}

impl FlowTrigger {
    pub fn flow_id(&self) -> FlowId {
        match self {
            FlowTrigger::Msg { flow_id, .. }
            | FlowTrigger::Channel { flow_id, .. }
            | FlowTrigger::IncomingCall { flow_id, .. }
            | FlowTrigger::Start { flow_id, .. } => *flow_id,
        }
    }
}

/// What advances a waiting session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowResume {
    Msg { msg: MsgIn },
    RunExpiration,
    WaitTimeout,
}

/// An outgoing message spec emitted by the engine; the msg_created hook
/// turns it into a persisted row and a courier spool entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MsgOutSpec {
    pub uuid: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_uuid: Option<Uuid>,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub quick_replies: Vec<String>,
}

/// Events produced during a sprint, in engine emission order.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SprintEvent {
    MsgCreated {
        msg: MsgOutSpec,
    },
    MsgReceived {
        msg_id: crate::models::MsgId,
        #[serde(skip_serializing_if = "Option::is_none")]
        external_id: Option<String>,
        created_on: DateTime<Utc>,
    },
    SessionTriggered {
        flow_uuid: Uuid,
        #[serde(default)]
        group_uuids: Vec<Uuid>,
        #[serde(default)]
        contact_ids: Vec<crate::models::ContactId>,
        #[serde(default)]
        urns: Vec<String>,
        #[serde(default)]
        create_contact: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_summary: Option<Value>,
    },
    WebhookCalled {
        url: String,
        status_code: u16,
        elapsed_ms: i64,
        request: String,
        response: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        resthook: Option<String>,
    },
    EmailSent {
        to: Vec<String>,
        subject: String,
        body: String,
    },
    TicketOpened {
        ticketer_uuid: Uuid,
        subject: String,
        body: String,
    },
}

/// One engine step: the new session state, the runs it touched and the
/// events it emitted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Sprint {
    pub session: SessionOutput,
    pub runs: Vec<RunOutput>,
    pub events: Vec<SprintEvent>,
}

/// The narrow interface the core consumes. Implementations wrap the real
/// flow engine; tests use a mock.
#[async_trait]
pub trait FlowEngine: Send + Sync {
    /// Start a new session for the contact from the given trigger.
    async fn new_session(
        &self,
        assets: &OrgAssets,
        contact: &Contact,
        trigger: &FlowTrigger,
    ) -> anyhow::Result<Sprint>;

    /// Advance a waiting session. Implementations may assume the session is
    /// not terminal; the runner enforces that before calling.
    async fn resume(
        &self,
        assets: &OrgAssets,
        contact: &Contact,
        session: &Session,
        resume: &FlowResume,
    ) -> anyhow::Result<Sprint>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_serialization_is_tagged() {
        let trigger = FlowTrigger::Start {
            flow_id: FlowId(4),
            start_id: Some(StartId(9)),
            parent_summary: None,
        };
        let json = serde_json::to_value(&trigger).unwrap();
        assert_eq!(json["type"], "start");
        assert_eq!(json["flow_id"], 4);
        assert!(json.get("parent_summary").is_none());
    }

    #[test]
    fn test_engine_options_from_config() {
        let config = crate::config::Config::default();
        let options = EngineOptions::from_config(&config);
        assert_eq!(options.max_steps_per_sprint, config.max_steps_per_sprint);
        assert_eq!(
            options.webhook_max_body_bytes,
            config.webhook_max_body_bytes
        );
    }

    #[test]
    fn test_resume_round_trip() {
        let resume = FlowResume::WaitTimeout;
        let json = serde_json::to_string(&resume).unwrap();
        assert!(json.contains("wait_timeout"));
        let back: FlowResume = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, FlowResume::WaitTimeout));
    }
}
