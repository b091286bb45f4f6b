use anyhow::Result;
use async_trait::async_trait;

use crate::config::IndexDefinition;
use crate::model::IndexedItemModel;

/// Collaborator giving the rebuild path access to the live content store.
/// A full rebuild enumerates every item currently in scope of the index
/// definition and re-indexes it from scratch.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn items_in_scope(&self, definition: &IndexDefinition)
        -> Result<Vec<IndexedItemModel>>;
}
