use chrono::Utc;
use uuid::Uuid;

use switchyard::assets::OrgAssets;
use switchyard::models::{
    Channel, ChannelId, Contact, ContactId, ContactStatus, ContactUrn, Flow, FlowId, FlowType,
    Org, OrgId, Trigger, TriggerId, TriggerType, UrnId,
};

pub fn test_org(id: i64) -> Org {
    Org {
        id: OrgId(id),
        uuid: Uuid::new_v4(),
        name: format!("Org {}", id),
        language: Some("eng".to_string()),
        uses_topups: false,
        config: serde_json::Value::Null,
    }
}

pub fn test_channel(id: i64, org: OrgId) -> Channel {
    Channel {
        id: ChannelId(id),
        uuid: Uuid::new_v4(),
        org_id: org,
        name: format!("Channel {}", id),
        channel_type: "T".to_string(),
        address: Some("+12065551212".to_string()),
        config: serde_json::json!({
            "account_sid": "AC0000000000",
            "auth_token": "secret",
        }),
    }
}

pub fn test_flow(id: i64, org: OrgId, flow_type: FlowType) -> Flow {
    Flow {
        id: FlowId(id),
        uuid: Uuid::new_v4(),
        org_id: org,
        name: format!("Flow {}", id),
        flow_type,
        ignore_triggers: false,
    }
}

pub fn test_keyword_trigger(id: i64, org: OrgId, flow: FlowId, keyword: &str) -> Trigger {
    Trigger {
        id: TriggerId(id),
        org_id: org,
        flow_id: flow,
        trigger_type: TriggerType::Keyword,
        keyword: Some(keyword.to_string()),
        referrer_id: None,
        channel_id: None,
    }
}

pub fn test_contact(id: i64, org: OrgId) -> Contact {
    Contact {
        id: ContactId(id),
        uuid: Uuid::new_v4(),
        org_id: org,
        name: Some(format!("Contact {}", id)),
        language: None,
        status: ContactStatus::Active,
        created_on: Utc::now(),
        last_seen_on: None,
        urns: vec![ContactUrn {
            id: UrnId(id * 10),
            scheme: "tel".to_string(),
            path: format!("+1206555{:04}", id % 10_000),
            channel_id: None,
            priority: 1000,
        }],
    }
}

/// Assets for one org with a messaging flow, a voice flow, a channel and a
/// keyword trigger on the messaging flow.
pub fn test_assets(org_id: i64) -> OrgAssets {
    let org = test_org(org_id);
    let id = org.id;
    OrgAssets::from_parts(
        org,
        vec![test_channel(1, id)],
        vec![
            test_flow(1, id, FlowType::Messaging),
            test_flow(2, id, FlowType::Voice),
        ],
        Vec::new(),
        Vec::new(),
        vec![test_keyword_trigger(1, id, FlowId(1), "join")],
    )
}
