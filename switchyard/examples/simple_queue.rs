//! Simple queue example demonstrating fair enqueue/pop across owners.
//!
//! Uses the in-memory store from switchyard-testkit so it runs without
//! Redis or Postgres.

use switchyard::models::OrgId;
use switchyard::queue::{QueueName, TaskQueue};
use switchyard::task::{Task, TaskPriority, TaskType};
use switchyard_testkit::MemoryStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let store = MemoryStore::new();

    // one busy org with a deep backlog, one org with a single urgent task
    let busy = OrgId(1);
    let quiet = OrgId(2);

    for i in 0..5 {
        let task = Task::new(TaskType::StartFlow, busy, &serde_json::json!({ "n": i }))?;
        store
            .push(QueueName::Batch, busy, &task, TaskPriority::Default)
            .await?;
    }

    let urgent = Task::new(TaskType::StartFlow, quiet, &serde_json::json!({ "n": "urgent" }))?;
    store
        .push(QueueName::Batch, quiet, &urgent, TaskPriority::High)
        .await?;

    // the quiet org is served within its fair share despite arriving last
    while let Some(task) = store.pop(QueueName::Batch).await? {
        println!("popped org={} payload={}", task.org_id, task.task);
    }

    Ok(())
}
