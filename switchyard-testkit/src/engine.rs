use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use switchyard::assets::OrgAssets;
use switchyard::engine::{FlowEngine, FlowResume, FlowTrigger, Sprint};
use switchyard::models::{
    Contact, ContactId, FlowId, RunOutput, RunStatus, Session, SessionOutput, SessionStatus,
    SessionType, Step,
};

/// One recorded engine invocation.
#[derive(Clone, Debug)]
pub enum EngineCall {
    NewSession {
        contact_id: ContactId,
        flow_id: FlowId,
    },
    Resume {
        contact_id: ContactId,
        resume_type: &'static str,
    },
}

/// Scriptable mock flow engine. By default every trigger produces a waiting
/// session with a single waiting run and no events; scripted sprints and
/// failures can be queued for specific behaviors.
#[derive(Default)]
pub struct MockEngine {
    scripted: Mutex<VecDeque<anyhow::Result<Sprint>>>,
    calls: Mutex<Vec<EngineCall>>,
    complete_immediately: bool,
}

impl MockEngine {
    pub fn new() -> MockEngine {
        MockEngine::default()
    }

    /// Produce completed sessions instead of waiting ones.
    pub fn completing() -> MockEngine {
        MockEngine {
            complete_immediately: true,
            ..MockEngine::default()
        }
    }

    /// Queue a scripted sprint returned by the next engine call.
    pub fn script(&self, sprint: Sprint) {
        self.scripted.lock().push_back(Ok(sprint));
    }

    /// Queue a failure returned by the next engine call.
    pub fn script_error(&self, msg: &str) {
        self.scripted
            .lock()
            .push_back(Err(anyhow::anyhow!("{}", msg)));
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// A plausible default sprint for the given flow.
    pub fn default_sprint(
        &self,
        flow_id: FlowId,
        session_type: SessionType,
    ) -> Sprint {
        let now = Utc::now();
        let (session_status, run_status, current_flow, timeout) = if self.complete_immediately {
            (SessionStatus::Completed, RunStatus::Completed, None, None)
        } else {
            (
                SessionStatus::Waiting,
                RunStatus::Waiting,
                Some(flow_id),
                None,
            )
        };

        Sprint {
            session: SessionOutput {
                uuid: Uuid::new_v4(),
                status: session_status,
                session_type,
                current_flow_id: current_flow,
                timeout_on: timeout,
                wait_started_on: (!self.complete_immediately).then_some(now),
                state: serde_json::json!({"runs": [], "status": session_status}),
                responded: false,
            },
            runs: vec![RunOutput {
                uuid: Uuid::new_v4(),
                flow_id,
                status: run_status,
                path: vec![Step {
                    uuid: Uuid::new_v4(),
                    node_uuid: Uuid::new_v4(),
                    arrived_on: now,
                    exit_uuid: None,
                }],
                results: serde_json::json!({}),
                created_on: now,
                modified_on: now,
                exited_on: self.complete_immediately.then_some(now),
                expires_on: None,
                responded: false,
            }],
            events: Vec::new(),
        }
    }
}

#[async_trait]
impl FlowEngine for MockEngine {
    async fn new_session(
        &self,
        assets: &OrgAssets,
        contact: &Contact,
        trigger: &FlowTrigger,
    ) -> anyhow::Result<Sprint> {
        let flow_id = trigger.flow_id();
        self.calls.lock().push(EngineCall::NewSession {
            contact_id: contact.id,
            flow_id,
        });

        if let Some(result) = self.scripted.lock().pop_front() {
            return result;
        }

        let session_type = assets
            .flow_by_id(flow_id)
            .map(|f| SessionType::from(f.flow_type))
            .unwrap_or(SessionType::Messaging);
        Ok(self.default_sprint(flow_id, session_type))
    }

    async fn resume(
        &self,
        _assets: &OrgAssets,
        contact: &Contact,
        session: &Session,
        resume: &FlowResume,
    ) -> anyhow::Result<Sprint> {
        let resume_type = match resume {
            FlowResume::Msg { .. } => "msg",
            FlowResume::RunExpiration => "run_expiration",
            FlowResume::WaitTimeout => "wait_timeout",
        };
        self.calls.lock().push(EngineCall::Resume {
            contact_id: contact.id,
            resume_type,
        });

        if let Some(result) = self.scripted.lock().pop_front() {
            return result;
        }

        let flow_id = session.current_flow_id.unwrap_or(FlowId(0));
        let mut sprint = self.default_sprint(flow_id, session.session_type);
        sprint.session.uuid = session.uuid;
        Ok(sprint)
    }
}
