use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::IndexRegistry;
use crate::model::{ArgumentError, IndexedItemModel, QueueItem, TaskType};
use crate::tasks::queue::{EnqueueError, QueueClient};

/// Content-change event vocabulary consumed from the CMS collaborator.
pub mod event {
    pub const PUBLISH: &str = "publish";
    pub const UPDATE: &str = "update";
    pub const DELETE: &str = "delete";
    pub const UNPUBLISH: &str = "unpublish";
    pub const ARCHIVE: &str = "archive";
}

#[derive(Debug, Error)]
pub enum TaskLoggerError {
    #[error(transparent)]
    Enqueue(#[from] EnqueueError),

    #[error(transparent)]
    Argument(#[from] ArgumentError),
}

fn task_type_for(event_name: &str) -> Option<TaskType> {
    match event_name {
        event::PUBLISH => Some(TaskType::Create),
        event::UPDATE => Some(TaskType::Update),
        event::DELETE | event::UNPUBLISH | event::ARCHIVE => Some(TaskType::Delete),
        _ => None,
    }
}

/// Translates raw content-change events into queue items, one per registered
/// index whose configuration matches the changed content. Enqueueing is fast
/// and does not wait for the flush; enqueue failures surface as errors.
pub struct TaskLogger {
    registry: Arc<IndexRegistry>,
    queue: QueueClient,
}

impl TaskLogger {
    pub fn new(registry: Arc<IndexRegistry>, queue: QueueClient) -> TaskLogger {
        TaskLogger { registry, queue }
    }

    /// Handles a changed web page item.
    pub async fn handle_event(
        &self,
        item: IndexedItemModel,
        event_name: &str,
    ) -> Result<(), TaskLoggerError> {
        self.fan_out(item, event_name, |definition, item| {
            definition.matches_web_page(item)
        })
    }

    /// Handles a changed reusable content item.
    pub async fn handle_content_item_event(
        &self,
        item: IndexedItemModel,
        event_name: &str,
    ) -> Result<(), TaskLoggerError> {
        self.fan_out(item, event_name, |definition, item| {
            definition.matches_content_item(item)
        })
    }

    /// Triggers a full rebuild of the index whose configured rebuild hook
    /// matches. Returns whether any index matched.
    pub async fn trigger_rebuild(&self, hook: &str) -> Result<bool, TaskLoggerError> {
        for definition in self.registry.definitions() {
            if definition.rebuild_hook.as_deref() == Some(hook) {
                self.queue.enqueue(QueueItem::rebuild(&definition.index_name)?)?;

                debug!(
                    message = "rebuild_triggered",
                    index = definition.index_name.as_str(),
                    hook
                );
                return Ok(true);
            }
        }

        warn!(message = "unknown_rebuild_hook", hook);
        Ok(false)
    }

    fn fan_out(
        &self,
        item: IndexedItemModel,
        event_name: &str,
        in_scope: impl Fn(&crate::config::IndexDefinition, &IndexedItemModel) -> bool,
    ) -> Result<(), TaskLoggerError> {
        let task_type = match task_type_for(event_name) {
            Some(task_type) => task_type,
            None => {
                warn!(
                    message = "unknown_event_dropped",
                    event_name,
                    item_guid = item.item_guid.as_str()
                );
                return Ok(());
            }
        };

        for definition in self.registry.definitions() {
            if !in_scope(definition, &item) {
                continue;
            }

            let queue_item =
                QueueItem::new(&definition.index_name, task_type, Some(item.clone()))?;

            self.queue.enqueue(queue_item)?;

            debug!(
                message = "task_logged",
                index = definition.index_name.as_str(),
                item_guid = item.item_guid.as_str(),
                task_type = format!("{task_type:?}").as_str()
            );
        }

        Ok(())
    }
}
