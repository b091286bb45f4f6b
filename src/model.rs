use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("queue item index name must not be empty")]
    EmptyIndexName,

    #[error("queue item of type {0:?} requires a content item snapshot")]
    MissingItemSnapshot(TaskType),
}

/// Kind of pending indexing operation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskType {
    Unknown,
    Create,
    Update,
    Delete,
    PublishIndex,
}

/// Immutable snapshot of a content item's identity and the fields needed for
/// indexing. Produced by the event-translation layer from the live content
/// store; never mutated afterwards.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexedItemModel {
    pub item_id: i64,
    pub item_guid: String,
    pub language_name: String,
    pub content_type_name: String,
    pub content_type_id: i64,
    pub content_language_id: i64,
    pub display_name: String,
    pub is_secured: bool,

    /// Channel the item belongs to. Reusable content items carry none.
    pub channel_name: Option<String>,

    /// Tree path within the channel. Reusable content items carry none.
    pub path: Option<String>,

    pub sort_order: i32,
}

impl IndexedItemModel {
    /// Key under which the item's document is stored in an index. One
    /// document per (guid, language) pair.
    pub fn unique_key(&self) -> String {
        format!("{}:{}", self.item_guid, self.language_name)
    }
}

/// One pending indexing operation targeted at one index.
///
/// The snapshot is absent only for [`TaskType::PublishIndex`], which rebuilds
/// the whole index and carries no item.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueItem {
    index_name: String,
    task_type: TaskType,
    item: Option<IndexedItemModel>,
}

impl QueueItem {
    pub fn new(
        index_name: &str,
        task_type: TaskType,
        item: Option<IndexedItemModel>,
    ) -> Result<QueueItem, ArgumentError> {
        if index_name.is_empty() {
            return Err(ArgumentError::EmptyIndexName);
        }

        if item.is_none() && task_type != TaskType::PublishIndex {
            return Err(ArgumentError::MissingItemSnapshot(task_type));
        }

        Ok(QueueItem {
            index_name: index_name.into(),
            task_type,
            item,
        })
    }

    pub fn rebuild(index_name: &str) -> Result<QueueItem, ArgumentError> {
        QueueItem::new(index_name, TaskType::PublishIndex, None)
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn item(&self) -> Option<&IndexedItemModel> {
        self.item.as_ref()
    }
}


#[cfg(test)]
mod tests {
    use super::test_utils::page_item;
    use super::*;

    #[test]
    fn new_rejects_empty_index_name() {
        let item = page_item("abc", "en", "Article");

        let err = QueueItem::new("", TaskType::Create, Some(item)).unwrap_err();

        assert_eq!(ArgumentError::EmptyIndexName, err);
    }

    #[test]
    fn new_rejects_empty_index_name_for_rebuild() {
        let err = QueueItem::rebuild("").unwrap_err();

        assert_eq!(ArgumentError::EmptyIndexName, err);
    }

    #[test]
    fn new_rejects_missing_snapshot_unless_rebuild() {
        for task_type in [
            TaskType::Unknown,
            TaskType::Create,
            TaskType::Update,
            TaskType::Delete,
        ] {
            let err = QueueItem::new("articles", task_type, None).unwrap_err();

            assert_eq!(ArgumentError::MissingItemSnapshot(task_type), err);
        }
    }

    #[test]
    fn rebuild_carries_no_snapshot() {
        let item = QueueItem::rebuild("articles").unwrap();

        assert_eq!(TaskType::PublishIndex, item.task_type());
        assert!(item.item().is_none());
    }

    #[test]
    fn unique_key_combines_guid_and_language() {
        let item = page_item("abc", "en", "Article");

        assert_eq!("abc:en", item.unique_key());
    }
}
