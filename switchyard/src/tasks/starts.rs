//! The flow start fan-out pipeline.
//!
//! A `start_flow` task resolves its target population to a set of unique
//! contact ids, then chunks that set into batches small enough to schedule
//! fairly. Batches execute as `start_flow_batch` (or `start_ivr_flow_batch`
//! for voice flows) on the batch queue, except for tiny starts which go to
//! the handler queue for low latency.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{TaskError, TaskResult};
use crate::models::{
    self, ContactId, FlowStart, FlowStartBatch, FlowType, SessionType,
};
use crate::queue::{QueueName, TaskQueue};
use crate::runner;
use crate::runtime::Runtime;
use crate::search::SearchError;
use crate::task::{Task, TaskPriority, TaskType};

/// Which queue and task type a start's batches are dispatched with. Starts
/// of one or two contacts skip the batch queue so trigger-driven starts stay
/// low latency.
pub fn route_start(contact_count: usize, flow_type: FlowType) -> (QueueName, TaskType) {
    let queue = if contact_count <= 2 {
        QueueName::Handler
    } else {
        QueueName::Batch
    };
    let task_type = match flow_type {
        FlowType::Voice => TaskType::StartIvrFlowBatch,
        _ => TaskType::StartFlowBatch,
    };
    (queue, task_type)
}

/// Chunk the resolved population into batches, flagging the final one.
pub fn plan_batches(ids: &[ContactId], batch_size: usize) -> Vec<(Vec<ContactId>, bool)> {
    let mut batches: Vec<(Vec<ContactId>, bool)> = ids
        .chunks(batch_size.max(1))
        .map(|chunk| (chunk.to_vec(), false))
        .collect();
    if let Some(last) = batches.last_mut() {
        last.1 = true;
    }
    batches
}

/// Handler for `start_flow`: build the batches for a start. A bad contact
/// query is the user's error and fails the start quietly; infrastructure
/// errors leave the start visible for retry.
pub async fn handle_start_flow(rt: Arc<Runtime>, task: Task) -> TaskResult {
    let start: FlowStart = task.decode()?;

    match create_flow_batches(&rt, &start).await {
        Ok(()) => Ok(()),
        Err(TaskError::UserInput(msg)) => {
            models::mark_start_failed(&rt.db, start.id).await?;
            tracing::info!(start_id = %start.id, "flow start failed on user query: {}", msg);
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Resolve the start's population and enqueue its batches.
pub async fn create_flow_batches(rt: &Runtime, start: &FlowStart) -> TaskResult {
    let org_id = start.org_id;
    let mut seen: HashSet<ContactId> = HashSet::new();
    let mut ids: Vec<ContactId> = Vec::new();
    let mut add = |id: ContactId, ids: &mut Vec<ContactId>| {
        if seen.insert(id) {
            ids.push(id);
        }
    };

    for id in &start.contact_ids {
        add(*id, &mut ids);
    }

    let mut created: Vec<ContactId> = Vec::new();
    if !start.urns.is_empty() {
        let (resolved, newly_created) =
            models::get_or_create_ids_from_urns(&rt.db, org_id, &start.urns).await?;
        for id in resolved {
            add(id, &mut ids);
        }
        created = newly_created;
    }

    if start.create_contact {
        let contact = models::create_contact(&rt.db, org_id).await?;
        add(contact.id, &mut ids);
        created.push(contact.id);
    }

    if !start.group_ids.is_empty() {
        for id in models::contact_ids_for_groups(&rt.db, &start.group_ids).await? {
            add(id, &mut ids);
        }
    }

    if let Some(query) = start.query.as_deref().filter(|q| !q.is_empty()) {
        match rt.searcher.contact_ids_for_query(org_id, query).await {
            Ok(matches) => {
                for id in matches {
                    add(id, &mut ids);
                }
            }
            Err(SearchError::UserQuery(msg)) => return Err(TaskError::UserInput(msg)),
            Err(SearchError::Io(err)) => return Err(TaskError::Transient(err)),
        }
    }

    if !start.exclude_group_ids.is_empty() {
        let excluded: HashSet<ContactId> =
            models::contact_ids_for_groups(&rt.db, &start.exclude_group_ids)
                .await?
                .into_iter()
                .collect();
        ids.retain(|id| !excluded.contains(id));
    }

    if !start.restart_participants {
        let already_started: HashSet<ContactId> =
            models::find_flow_started_overlap(&rt.db, start.flow_id, &ids)
                .await?
                .into_iter()
                .collect();
        ids.retain(|id| !already_started.contains(id));
    }

    if !start.include_active {
        let active: HashSet<ContactId> = models::find_active_session_overlap(
            &rt.db,
            SessionType::from(start.flow_type),
            &ids,
        )
        .await?
        .into_iter()
        .collect();
        ids.retain(|id| !active.contains(id));
    }

    // the last batch completes the start; an empty population completes it
    // here and now
    models::mark_start_started(&rt.db, start.id, ids.len(), &created).await?;
    if ids.is_empty() {
        models::mark_start_complete(&rt.db, start.id).await?;
        return Ok(());
    }

    let (queue, task_type) = route_start(ids.len(), start.flow_type);
    let total = ids.len();
    for (chunk, is_last) in plan_batches(&ids, rt.config.start_batch_size) {
        let batch = start.create_batch(chunk, is_last, total);
        let task = Task::new(task_type, org_id, &batch)?;
        rt.store
            .push(queue, org_id, &task, TaskPriority::Default)
            .await?;
    }

    Ok(())
}

/// Handler for `start_flow_batch`: run one batch of contacts through the
/// engine.
pub async fn handle_start_flow_batch(rt: Arc<Runtime>, task: Task) -> TaskResult {
    let batch: FlowStartBatch = task.decode()?;
    runner::start_flow_batch(&rt, &batch).await
}

/// Handler for `start_ivr_flow_batch`: request an outgoing call for each
/// contact. The IVR provider drives the session from its callbacks, so no
/// sessions are started inline here.
pub async fn handle_start_ivr_flow_batch(rt: Arc<Runtime>, task: Task) -> TaskResult {
    let batch: FlowStartBatch = task.decode()?;

    let assets = rt
        .assets
        .get(&rt.db, batch.org_id)
        .await?
        .ok_or_else(|| TaskError::DataMissing(format!("org {}", batch.org_id)))?;

    let contacts = models::load_contacts(&rt.db, batch.org_id, &batch.contact_ids).await?;
    for contact in contacts {
        let Some(urn) = contact
            .urns
            .iter()
            .find(|u| u.scheme == "tel")
            .or_else(|| contact.preferred_urn())
        else {
            tracing::info!(contact_id = %contact.id, "skipping IVR start, contact has no URN");
            continue;
        };

        let channel_id = urn
            .channel_id
            .or_else(|| assets.channels().first().map(|c| c.id));
        let Some(channel_id) = channel_id else {
            tracing::info!(contact_id = %contact.id, "skipping IVR start, no channel for URN");
            continue;
        };

        let connection_id = models::insert_channel_connection(
            &rt.db,
            batch.org_id,
            channel_id,
            contact.id,
            urn.id,
        )
        .await?;

        tracing::info!(
            contact_id = %contact.id,
            connection_id = %connection_id,
            flow_id = %batch.flow_id,
            "requested outgoing IVR call"
        );
    }

    if batch.is_last {
        models::mark_start_complete(&rt.db, batch.start_id).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact_ids(n: usize) -> Vec<ContactId> {
        (0..n as i64).map(ContactId).collect()
    }

    #[test]
    fn test_plan_batches_chunks_and_flags_last() {
        let batches = plan_batches(&contact_ids(121), 100);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].0.len(), 100);
        assert_eq!(batches[1].0.len(), 21);
        assert!(!batches[0].1);
        assert!(batches[1].1);

        let total: usize = batches.iter().map(|(ids, _)| ids.len()).sum();
        assert_eq!(total, 121);
    }

    #[test]
    fn test_plan_batches_single() {
        let batches = plan_batches(&contact_ids(1), 100);
        assert_eq!(batches.len(), 1);
        assert!(batches[0].1);
    }

    #[test]
    fn test_plan_batches_exact_multiple() {
        let batches = plan_batches(&contact_ids(200), 100);
        assert_eq!(batches.len(), 2);
        assert!(!batches[0].1);
        assert!(batches[1].1);

        // exactly one batch carries the last flag
        assert_eq!(batches.iter().filter(|(_, last)| *last).count(), 1);
    }

    #[test]
    fn test_plan_batches_empty() {
        assert!(plan_batches(&[], 100).is_empty());
    }

    #[test]
    fn test_route_small_starts_to_handler_queue() {
        assert_eq!(
            route_start(1, FlowType::Messaging),
            (QueueName::Handler, TaskType::StartFlowBatch)
        );
        assert_eq!(
            route_start(2, FlowType::Messaging),
            (QueueName::Handler, TaskType::StartFlowBatch)
        );
        assert_eq!(
            route_start(3, FlowType::Messaging),
            (QueueName::Batch, TaskType::StartFlowBatch)
        );
    }

    #[test]
    fn test_route_voice_flows_to_ivr_batches() {
        assert_eq!(
            route_start(50, FlowType::Voice),
            (QueueName::Batch, TaskType::StartIvrFlowBatch)
        );
        assert_eq!(
            route_start(1, FlowType::Voice),
            (QueueName::Handler, TaskType::StartIvrFlowBatch)
        );
    }
}
