//! Provider-driven batch sender for studio-style starts.
//!
//! Instead of running the flow engine, a studio start posts one execution
//! request per contact to the external provider at a fixed rate, persisting
//! progress metadata on the start as it goes.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::error::{TaskError, TaskResult};
use crate::lock::{channel_lock, LeaseLock};
use crate::models::{self, ContactId, StudioFlowStart};
use crate::runtime::Runtime;
use crate::task::Task;

/// Handler for `studio_flow_start` tasks.
pub async fn handle_studio_flow_start(rt: Arc<Runtime>, task: Task) -> TaskResult {
    let start: StudioFlowStart = task.decode()?;

    let assets = rt
        .assets
        .get(&rt.db, start.org_id)
        .await?
        .ok_or_else(|| TaskError::DataMissing(format!("org {}", start.org_id)))?;

    // credentials come from the channel's provider config; missing config
    // is a setup failure that fails the start outright
    let Some(channel) = assets.channel_by_id(start.channel_id) else {
        models::mark_start_failed(&rt.db, start.id).await?;
        return Err(TaskError::UserInput(format!(
            "studio start channel {} not found",
            start.channel_id
        )));
    };
    let Some(account_sid) = channel.config_value("account_sid").map(str::to_string) else {
        models::mark_start_failed(&rt.db, start.id).await?;
        return Err(TaskError::UserInput(format!(
            "missing account sid for org {}",
            start.org_id
        )));
    };
    let Some(auth_token) = channel.config_value("auth_token").map(str::to_string) else {
        models::mark_start_failed(&rt.db, start.id).await?;
        return Err(TaskError::UserInput(format!(
            "missing account auth token for org {}",
            start.org_id
        )));
    };
    let from = channel.address.clone().unwrap_or_default();

    let mut seen: HashSet<ContactId> = HashSet::new();
    let mut contact_ids: Vec<ContactId> = Vec::new();
    for id in &start.contact_ids {
        if seen.insert(*id) {
            contact_ids.push(*id);
        }
    }
    if !start.group_ids.is_empty() {
        for id in models::contact_ids_for_groups(&rt.db, &start.group_ids).await? {
            if seen.insert(id) {
                contact_ids.push(id);
            }
        }
    }

    if contact_ids.is_empty() {
        models::mark_start_complete(&rt.db, start.id).await?;
        return Ok(());
    }

    // one studio run per channel at a time, so the provider's rate limit is
    // never split across workers
    let lock_name = channel_lock(start.org_id, start.channel_id);
    let Some(lock_token) = rt
        .store
        .acquire(
            &lock_name,
            Duration::from_secs(60 * 60),
            Duration::from_secs(10),
        )
        .await?
    else {
        return Err(TaskError::Transient(anyhow::anyhow!(
            "channel {} already has a studio start in flight",
            start.channel_id
        )));
    };

    let result = send_executions(&rt, &start, &account_sid, &auth_token, &from, &contact_ids).await;

    if let Err(err) = rt.store.release(&lock_name, &lock_token).await {
        tracing::warn!(channel_id = %start.channel_id, "error releasing channel lock: {:#}", err);
    }
    result
}

async fn send_executions(
    rt: &Runtime,
    start: &StudioFlowStart,
    account_sid: &str,
    auth_token: &str,
    from: &str,
    contact_ids: &[ContactId],
) -> TaskResult {
    let send_url = format!(
        "https://studio.twilio.com/v2/Flows/{}/Executions",
        start.flow_sid
    );

    let chunk_size = rt.config.studio_chunk_size.max(1);
    let total_contacts = contact_ids.len();
    let mut success_count = 0usize;
    let mut failure_count = 0usize;
    let mut processed_batches = 0usize;

    // provider rate limit: one chunk per second
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    for chunk in contact_ids.chunks(chunk_size) {
        ticker.tick().await;

        let phones = match models::load_contact_phones(&rt.db, chunk).await {
            Ok(phones) => phones,
            Err(err) => {
                models::mark_start_failed(&rt.db, start.id).await?;
                return Err(TaskError::Transient(
                    err.context("error getting contact urns"),
                ));
            }
        };

        for phone in phones {
            let form = [("To", phone.as_str()), ("From", from)];
            let sent = rt
                .http
                .post(&send_url)
                .basic_auth(account_sid, Some(auth_token))
                .header("Accept", "application/json")
                .form(&form)
                .send()
                .await;

            // request failures only count against the run, never abort it
            match sent {
                Ok(resp) if resp.status() == reqwest::StatusCode::CREATED => success_count += 1,
                _ => failure_count += 1,
            }
        }
        processed_batches += 1;

        let metadata = json!({
            "total_contacts": total_contacts,
            "success_count": success_count,
            "failure_count": failure_count,
            "processed_batches": processed_batches,
            "batch_size": chunk_size,
        });
        if let Err(err) = models::update_start_metadata(&rt.db, start.id, &metadata).await {
            tracing::warn!(start_id = %start.id, "error persisting start metadata: {:#}", err);
        }
    }

    tracing::info!(
        start_id = %start.id,
        total = total_contacts,
        succeeded = success_count,
        failed = failure_count,
        "studio flow start finished"
    );

    models::mark_start_complete(&rt.db, start.id).await?;
    Ok(())
}
