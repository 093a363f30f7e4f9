//! Task handlers, one module per dispatch path.

pub mod contacts;
pub mod starts;
pub mod studio;

use crate::runtime::HandlerRegistry;
use crate::task::TaskType;

/// The standard handler registry, wired by the composition root. Every task
/// type that can appear on the shared queues has an entry here.
pub fn default_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();

    registry.register_fn(TaskType::HandleContactEvent, contacts::handle_contact_event);
    registry.register_fn(TaskType::StartFlow, starts::handle_start_flow);
    registry.register_fn(TaskType::StartFlowBatch, starts::handle_start_flow_batch);
    registry.register_fn(
        TaskType::StartIvrFlowBatch,
        starts::handle_start_ivr_flow_batch,
    );
    registry.register_fn(TaskType::StudioFlowStart, studio::handle_studio_flow_start);

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_covers_queue_task_types() {
        let registry = default_registry();
        for task_type in [
            TaskType::HandleContactEvent,
            TaskType::StartFlow,
            TaskType::StartFlowBatch,
            TaskType::StartIvrFlowBatch,
            TaskType::StudioFlowStart,
        ] {
            assert!(registry.get(task_type).is_some(), "{} missing", task_type);
        }

        // contact events are not dispatched from the shared queues
        assert!(registry.get(TaskType::MsgEvent).is_none());
    }
}
