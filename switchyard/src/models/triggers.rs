use sqlx::{PgExecutor, Row};

use super::{Channel, ChannelId, FlowId, OrgId, TriggerId};

/// Kinds of rules that map an incoming stimulus to a flow start.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TriggerType {
    /// Fires when the first word of an inbound message matches the keyword.
    Keyword,
    /// Fires on any inbound message, but only when the contact has no
    /// active session.
    Catchall,
    NewConversation,
    Referral,
    MissedCall,
    IncomingCall,
}

impl TriggerType {
    pub fn from_str(value: &str) -> Option<TriggerType> {
        match value {
            "K" => Some(TriggerType::Keyword),
            "C" => Some(TriggerType::Catchall),
            "N" => Some(TriggerType::NewConversation),
            "R" => Some(TriggerType::Referral),
            "M" => Some(TriggerType::MissedCall),
            "V" => Some(TriggerType::IncomingCall),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Trigger {
    pub id: TriggerId,
    pub org_id: OrgId,
    pub flow_id: FlowId,
    pub trigger_type: TriggerType,
    pub keyword: Option<String>,
    pub referrer_id: Option<String>,
    pub channel_id: Option<ChannelId>,
}

pub async fn load_triggers(db: impl PgExecutor<'_>, org_id: OrgId) -> anyhow::Result<Vec<Trigger>> {
    let rows = sqlx::query(
        r#"
        SELECT id, flow_id, trigger_type, keyword, referrer_id, channel_id
        FROM triggers_trigger
        WHERE org_id = $1 AND is_active = TRUE AND is_archived = FALSE
        ORDER BY id
        "#,
    )
    .bind(org_id.0)
    .fetch_all(db)
    .await?;

    let mut triggers = Vec::with_capacity(rows.len());
    for row in rows {
        let trigger_type: String = row.try_get("trigger_type")?;
        let Some(trigger_type) = TriggerType::from_str(&trigger_type) else {
            continue;
        };
        triggers.push(Trigger {
            id: TriggerId(row.try_get("id")?),
            org_id,
            flow_id: FlowId(row.try_get("flow_id")?),
            trigger_type,
            keyword: row.try_get("keyword")?,
            referrer_id: row.try_get("referrer_id")?,
            channel_id: row.try_get::<Option<i64>, _>("channel_id")?.map(ChannelId),
        });
    }
    Ok(triggers)
}

/// First word of a message, lowercased, for keyword matching.
fn first_word(text: &str) -> Option<String> {
    text.split_whitespace().next().map(|w| {
        w.trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase()
    })
}

/// Find the trigger matching an inbound message: keyword triggers win over
/// the catchall.
pub fn find_matching_msg_trigger<'t>(triggers: &'t [Trigger], text: &str) -> Option<&'t Trigger> {
    let word = first_word(text);

    if let Some(word) = &word {
        if let Some(t) = triggers.iter().find(|t| {
            t.trigger_type == TriggerType::Keyword && t.keyword.as_deref() == Some(word.as_str())
        }) {
            return Some(t);
        }
    }

    triggers
        .iter()
        .find(|t| t.trigger_type == TriggerType::Catchall)
}

/// Channel-specific triggers beat org-wide ones.
fn find_channel_trigger<'t>(
    triggers: &'t [Trigger],
    trigger_type: TriggerType,
    channel: Option<&Channel>,
    matches: impl Fn(&Trigger) -> bool,
) -> Option<&'t Trigger> {
    let of_type: Vec<&Trigger> = triggers
        .iter()
        .filter(|t| t.trigger_type == trigger_type && matches(t))
        .collect();

    if let Some(channel) = channel {
        let pinned = of_type
            .iter()
            .find(|t| t.channel_id == Some(channel.id))
            .copied();
        if pinned.is_some() {
            return pinned;
        }
    }
    of_type.into_iter().find(|t| t.channel_id.is_none())
}

pub fn find_matching_new_conversation_trigger<'t>(
    triggers: &'t [Trigger],
    channel: &Channel,
) -> Option<&'t Trigger> {
    find_channel_trigger(triggers, TriggerType::NewConversation, Some(channel), |_| {
        true
    })
}

pub fn find_matching_referral_trigger<'t>(
    triggers: &'t [Trigger],
    channel: &Channel,
    referrer_id: Option<&str>,
) -> Option<&'t Trigger> {
    // prefer a trigger pinned to this referrer, then any referral trigger
    if let Some(referrer) = referrer_id {
        if let Some(t) = find_channel_trigger(triggers, TriggerType::Referral, Some(channel), |t| {
            t.referrer_id
                .as_deref()
                .is_some_and(|r| r.eq_ignore_ascii_case(referrer))
        }) {
            return Some(t);
        }
    }
    find_channel_trigger(triggers, TriggerType::Referral, Some(channel), |t| {
        t.referrer_id.as_deref().unwrap_or("").is_empty()
    })
}

pub fn find_matching_missed_call_trigger(triggers: &[Trigger]) -> Option<&Trigger> {
    find_channel_trigger(triggers, TriggerType::MissedCall, None, |_| true)
}

pub fn find_matching_incoming_call_trigger(triggers: &[Trigger]) -> Option<&Trigger> {
    find_channel_trigger(triggers, TriggerType::IncomingCall, None, |_| true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyword_trigger(id: i64, flow: i64, keyword: &str) -> Trigger {
        Trigger {
            id: TriggerId(id),
            org_id: OrgId(1),
            flow_id: FlowId(flow),
            trigger_type: TriggerType::Keyword,
            keyword: Some(keyword.to_string()),
            referrer_id: None,
            channel_id: None,
        }
    }

    fn catchall_trigger(id: i64, flow: i64) -> Trigger {
        Trigger {
            id: TriggerId(id),
            org_id: OrgId(1),
            flow_id: FlowId(flow),
            trigger_type: TriggerType::Catchall,
            keyword: None,
            referrer_id: None,
            channel_id: None,
        }
    }

    #[test]
    fn test_keyword_match_on_first_word() {
        let triggers = vec![keyword_trigger(1, 10, "join"), catchall_trigger(2, 20)];

        let t = find_matching_msg_trigger(&triggers, "Join the group please").unwrap();
        assert_eq!(t.flow_id, FlowId(10));

        // keyword not first word -> catchall
        let t = find_matching_msg_trigger(&triggers, "please join").unwrap();
        assert_eq!(t.flow_id, FlowId(20));
    }

    #[test]
    fn test_keyword_strips_punctuation() {
        let triggers = vec![keyword_trigger(1, 10, "stop")];
        let t = find_matching_msg_trigger(&triggers, "STOP!").unwrap();
        assert_eq!(t.flow_id, FlowId(10));
    }

    #[test]
    fn test_no_match_without_catchall() {
        let triggers = vec![keyword_trigger(1, 10, "join")];
        assert!(find_matching_msg_trigger(&triggers, "hello").is_none());
    }

    #[test]
    fn test_channel_specific_trigger_wins() {
        let channel = Channel {
            id: ChannelId(5),
            uuid: uuid::Uuid::new_v4(),
            org_id: OrgId(1),
            name: "Test".to_string(),
            channel_type: "T".to_string(),
            address: None,
            config: serde_json::Value::Null,
        };

        let mut generic = catchall_trigger(1, 10);
        generic.trigger_type = TriggerType::NewConversation;
        let mut pinned = catchall_trigger(2, 20);
        pinned.trigger_type = TriggerType::NewConversation;
        pinned.channel_id = Some(ChannelId(5));

        let triggers = vec![generic, pinned];
        let t = find_matching_new_conversation_trigger(&triggers, &channel).unwrap();
        assert_eq!(t.flow_id, FlowId(20));
    }
}
