use std::collections::HashMap;
use std::sync::Arc;

use tantivy::schema::{self, SchemaBuilder, TextFieldIndexing, TextOptions};
use thiserror::Error;

use crate::config::AnalyzerKind;
use crate::json;
use crate::model::IndexedItemModel;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("item {item_guid} ({language_name}) is missing identity fields")]
    MissingIdentity {
        item_guid: String,
        language_name: String,
    },

    #[error("document does not match the index schema: {0}")]
    SchemaMismatch(String),
}

/// Pluggable logic converting a content snapshot into the field set stored in
/// an index. Strategies also declare the content fields they populate so the
/// index schema can be built from the definition at open time.
pub trait IndexingStrategy: Send + Sync {
    /// Add this strategy's content fields to the schema under construction.
    /// System fields are added by the index layer; strategies must not
    /// redefine them.
    fn configure_schema(&self, analyzer: AnalyzerKind, builder: &mut SchemaBuilder);

    /// Map a content snapshot to a JSON document matching the schema built by
    /// `configure_schema`. Facet values go into the `facet` system field as
    /// hierarchical paths.
    fn map_document(&self, item: &IndexedItemModel) -> Result<json::Value, MappingError>;
}

pub(crate) fn text_options(analyzer: AnalyzerKind) -> TextOptions {
    TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer(analyzer.tokenizer_name())
                .set_index_option(schema::IndexRecordOption::WithFreqsAndPositions),
        )
        .set_stored()
}

/// Maps the standard snapshot fields: display name as the searchable title,
/// tree path and sort order for navigation-aware consumers, and content
/// type/channel facets.
pub struct DefaultContentStrategy;

impl IndexingStrategy for DefaultContentStrategy {
    fn configure_schema(&self, analyzer: AnalyzerKind, builder: &mut SchemaBuilder) {
        builder.add_text_field("title", text_options(analyzer));
        builder.add_text_field("path", schema::STRING | schema::STORED);
        builder.add_i64_field("sort_order", schema::STORED | schema::FAST);
    }

    fn map_document(&self, item: &IndexedItemModel) -> Result<json::Value, MappingError> {
        if item.item_guid.is_empty() || item.language_name.is_empty() {
            return Err(MappingError::MissingIdentity {
                item_guid: item.item_guid.clone(),
                language_name: item.language_name.clone(),
            });
        }

        let mut facets = vec![json::json!(format!("/content_type/{}", item.content_type_name))];

        if let Some(channel) = &item.channel_name {
            facets.push(json::json!(format!("/channel/{channel}")));
        }

        Ok(json::json!({
            "title": item.display_name,
            "path": item.path.clone().unwrap_or_default(),
            "sort_order": item.sort_order,
            "facet": facets,
        }))
    }
}

/// Process-scoped registry mapping strategy names to implementations.
/// Populated before index definitions are loaded; not mutated afterwards.
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn IndexingStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> StrategyRegistry {
        StrategyRegistry {
            strategies: HashMap::new(),
        }
    }

    pub fn with_defaults() -> StrategyRegistry {
        let mut registry = StrategyRegistry::new();
        registry.register("default", Arc::new(DefaultContentStrategy));
        registry
    }

    pub fn register(&mut self, name: &str, strategy: Arc<dyn IndexingStrategy>) {
        self.strategies.insert(name.into(), strategy);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn IndexingStrategy>> {
        self.strategies.get(name).map(Arc::clone)
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        StrategyRegistry::with_defaults()
    }
}
