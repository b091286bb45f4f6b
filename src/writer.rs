use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tantivy::schema::Field;
use tantivy::{Document, IndexWriter, Searcher, Term};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{IndexDefinition, IndexRegistry};
use crate::index::{build_schema, IndexAccessError, IndexExt, IndexLoader, OpenMode};
use crate::json;
use crate::model::{IndexedItemModel, QueueItem, TaskType};
use crate::source::ContentSource;
use crate::strategy::{IndexingStrategy, MappingError, StrategyRegistry};

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("index {0} is not registered")]
    UnknownIndex(String),

    #[error(transparent)]
    Access(#[from] IndexAccessError),

    #[error("index {index} writer failed: {source}")]
    Engine {
        index: String,
        #[source]
        source: tantivy::TantivyError,
    },

    #[error("content source failed for index {index}: {source}")]
    ContentSource {
        index: String,
        #[source]
        source: anyhow::Error,
    },
}

fn engine_err(index: &str, source: tantivy::TantivyError) -> WriterError {
    WriterError::Engine {
        index: index.into(),
        source,
    }
}

/// Result of applying one flushed group to an index.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub applied: usize,
    pub skipped: usize,
    pub rebuilt: bool,
}

/// Owns access to the per-index writers and searchers.
///
/// At most one writer is open per index name at any time; acquisition is
/// serialized through an async mutex scoped to the index identity. Readers
/// take point-in-time snapshots and never contend with writers.
pub struct IndexWriterService {
    registry: Arc<IndexRegistry>,
    strategies: Arc<StrategyRegistry>,
    loader: Arc<dyn IndexLoader>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl IndexWriterService {
    pub fn new(
        registry: Arc<IndexRegistry>,
        strategies: Arc<StrategyRegistry>,
        loader: Arc<dyn IndexLoader>,
    ) -> IndexWriterService {
        IndexWriterService {
            registry,
            strategies,
            loader,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn writer_lock(&self, index_name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .expect("writer lock table should not be poisoned");

        Arc::clone(locks.entry(index_name.into()).or_default())
    }

    fn resolve(
        &self,
        index_name: &str,
    ) -> Result<(&IndexDefinition, Arc<dyn IndexingStrategy>), WriterError> {
        let definition = self
            .registry
            .get(index_name)
            .ok_or_else(|| WriterError::UnknownIndex(index_name.into()))?;

        let strategy = self
            .strategies
            .get(&definition.strategy)
            .ok_or_else(|| WriterError::UnknownIndex(index_name.into()))?;

        Ok((definition, strategy))
    }

    fn open(
        &self,
        definition: &IndexDefinition,
        strategy: &dyn IndexingStrategy,
        mode: OpenMode,
    ) -> Result<tantivy::Index, WriterError> {
        let schema = build_schema(definition, strategy);
        Ok(self
            .loader
            .load_index(&definition.index_name, schema, mode)?)
    }

    /// Runs an operation against the exclusively held writer for an index.
    /// Commits on success, rolls back on failure; either way the handle is
    /// released before returning, so readers never observe a half-applied
    /// session.
    pub async fn use_writer<T, F>(
        &self,
        index_name: &str,
        mode: OpenMode,
        op: F,
    ) -> Result<T, WriterError>
    where
        T: Send,
        F: FnOnce(&IndexWriter) -> Result<T, WriterError> + Send,
    {
        let (definition, strategy) = self.resolve(index_name)?;

        let lock = self.writer_lock(index_name);
        let _guard = lock.lock().await;

        let index = self.open(definition, strategy.as_ref(), mode)?;
        let mut writer = index
            .default_writer()
            .map_err(|source| engine_err(index_name, source))?;

        match op(&writer) {
            Ok(value) => {
                writer
                    .commit()
                    .map_err(|source| engine_err(index_name, source))?;
                info!(message = "index_commit", index = index_name);

                writer
                    .wait_merging_threads()
                    .map_err(|source| engine_err(index_name, source))?;

                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = writer.rollback() {
                    warn!(
                        message = "index_rollback_failed",
                        index = index_name,
                        error = rollback_err.to_string().as_str()
                    );
                }
                Err(err)
            }
        }
    }

    /// Applies one flushed group of queue items to its index.
    ///
    /// A `PublishIndex` item anywhere in the group turns the whole group into
    /// a full rebuild: storage is truncated and every item in scope is
    /// re-read from the content source. Otherwise items are applied in order,
    /// delete-then-add per unique key, with a single commit for the group.
    /// Items that fail to map are skipped and logged; the rest proceed.
    pub async fn apply_batch(
        &self,
        index_name: &str,
        items: Vec<QueueItem>,
        content: &dyn ContentSource,
    ) -> Result<BatchOutcome, WriterError> {
        let (definition, strategy) = self.resolve(index_name)?;

        if items
            .iter()
            .any(|item| item.task_type() == TaskType::PublishIndex)
        {
            let in_scope =
                content
                    .items_in_scope(definition)
                    .await
                    .map_err(|source| WriterError::ContentSource {
                        index: index_name.into(),
                        source,
                    })?;

            return self
                .use_writer(index_name, OpenMode::Create, move |writer| {
                    let mut outcome = BatchOutcome {
                        rebuilt: true,
                        ..BatchOutcome::default()
                    };

                    for item in &in_scope {
                        add_item(writer, strategy.as_ref(), item, &mut outcome)
                            .map_err(|source| engine_err(index_name, source))?;
                    }

                    Ok(outcome)
                })
                .await;
        }

        self.use_writer(index_name, OpenMode::CreateOrAppend, move |writer| {
            let mut outcome = BatchOutcome::default();

            for item in &items {
                let snapshot = match item.item() {
                    Some(snapshot) => snapshot,
                    // QueueItem::new rejects snapshot-less items for every
                    // type other than PublishIndex, handled above.
                    None => continue,
                };

                match item.task_type() {
                    TaskType::Create | TaskType::Update => {
                        delete_item(writer, snapshot);
                        add_item(writer, strategy.as_ref(), snapshot, &mut outcome)
                            .map_err(|source| engine_err(index_name, source))?;
                    }
                    TaskType::Delete => {
                        delete_item(writer, snapshot);
                        outcome.applied += 1;
                    }
                    TaskType::Unknown | TaskType::PublishIndex => {
                        warn!(
                            message = "unexpected_task_type",
                            index = item.index_name(),
                            task_type = format!("{:?}", item.task_type()).as_str()
                        );
                        outcome.skipped += 1;
                    }
                }
            }

            Ok(outcome)
        })
        .await
    }

    /// Drops and recreates the index storage.
    pub async fn reset_index(&self, index_name: &str) -> Result<(), WriterError> {
        self.use_writer(index_name, OpenMode::Create, |_writer| Ok(()))
            .await?;

        info!(message = "index_reset", index = index_name);

        Ok(())
    }

    /// Runs a read operation against a point-in-time searcher snapshot.
    /// The operation's error type only needs to absorb [`WriterError`], so
    /// read paths can layer their own failures on top.
    pub async fn use_searcher<T, E, F>(&self, index_name: &str, op: F) -> Result<T, E>
    where
        T: Send,
        E: From<WriterError>,
        F: FnOnce(&tantivy::Index, &Searcher) -> Result<T, E> + Send,
    {
        let (definition, strategy) = self.resolve(index_name).map_err(E::from)?;

        let index = self
            .open(definition, strategy.as_ref(), OpenMode::CreateOrAppend)
            .map_err(E::from)?;

        let reader = index
            .reader()
            .map_err(|source| E::from(engine_err(index_name, source)))?;

        let searcher = reader.searcher();

        op(&index, &searcher)
    }

    /// Like [`use_searcher`](Self::use_searcher) but also hands the operation
    /// the facet field for count aggregation.
    pub async fn use_searcher_with_facets<T, E, F>(&self, index_name: &str, op: F) -> Result<T, E>
    where
        T: Send,
        E: From<WriterError>,
        F: FnOnce(&tantivy::Index, &Searcher, Field) -> Result<T, E> + Send,
    {
        self.use_searcher(index_name, |index: &tantivy::Index, searcher: &Searcher| {
            let facet_field = index
                .schema()
                .get_field("facet")
                .expect("facet field should be present");

            op(index, searcher, facet_field)
        })
        .await
    }
}

fn delete_item(writer: &IndexWriter, item: &IndexedItemModel) {
    let id_field = writer.index().id_field();
    let doc_id = item.unique_key();

    writer.delete_term(Term::from_field_text(id_field, &doc_id));
    info!(message = "doc_deleted", doc_id = doc_id.as_str());
}

/// Builds and adds the document for one snapshot. Mapping failures skip the
/// item and bump the skip count; engine failures abort the session.
fn add_item(
    writer: &IndexWriter,
    strategy: &dyn IndexingStrategy,
    item: &IndexedItemModel,
    outcome: &mut BatchOutcome,
) -> Result<(), tantivy::TantivyError> {
    match build_document(writer, strategy, item) {
        Ok(document) => {
            writer.add_document(document)?;
            info!(message = "doc_indexed", doc_id = item.unique_key().as_str());
            outcome.applied += 1;
        }
        Err(err) => {
            warn!(
                message = "doc_mapping_failed",
                doc_id = item.unique_key().as_str(),
                error = err.to_string().as_str()
            );
            outcome.skipped += 1;
        }
    }

    Ok(())
}

fn build_document(
    writer: &IndexWriter,
    strategy: &dyn IndexingStrategy,
    item: &IndexedItemModel,
) -> Result<Document, MappingError> {
    let schema = writer.index().schema();

    let mut content = match strategy.map_document(item)? {
        json::Value::Object(object) => object,
        other => {
            return Err(MappingError::SchemaMismatch(format!(
                "strategy produced a non-object document: {other}"
            )))
        }
    };

    content.insert("__id".into(), json::Value::String(item.unique_key()));
    content.insert(
        "item_guid".into(),
        json::Value::String(item.item_guid.clone()),
    );
    content.insert(
        "language".into(),
        json::Value::String(item.language_name.clone()),
    );
    content.insert(
        "content_type".into(),
        json::Value::String(item.content_type_name.clone()),
    );

    schema
        .json_object_to_doc(content)
        .map_err(|err| MappingError::SchemaMismatch(err.to_string()))
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tantivy::collector::Count;
    use tantivy::query::AllQuery;

    use super::test_utils::service;
    use super::*;
    use crate::model::test_utils::page_item;
    use crate::source::test_utils::TestContentSource;

    async fn doc_count(service: &IndexWriterService, index_name: &str) -> usize {
        service
            .use_searcher(index_name, |_index, searcher| {
                searcher
                    .search(&AllQuery, &Count)
                    .map_err(|source| engine_err(index_name, source))
            })
            .await
            .unwrap()
    }

    fn create(guid: &str, language: &str) -> QueueItem {
        QueueItem::new(
            "articles",
            TaskType::Create,
            Some(page_item(guid, language, "Article")),
        )
        .unwrap()
    }

    fn delete(guid: &str, language: &str) -> QueueItem {
        QueueItem::new(
            "articles",
            TaskType::Delete,
            Some(page_item(guid, language, "Article")),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn create_adds_exactly_one_document_per_key() {
        let service = service();
        let content = TestContentSource::create();

        let outcome = service
            .apply_batch("articles", vec![create("a", "en")], &content)
            .await
            .unwrap();

        assert_eq!(
            BatchOutcome {
                applied: 1,
                skipped: 0,
                rebuilt: false
            },
            outcome
        );
        assert_eq!(1, doc_count(&service, "articles").await);

        // Re-indexing the same key replaces rather than duplicates.
        service
            .apply_batch("articles", vec![create("a", "en")], &content)
            .await
            .unwrap();

        assert_eq!(1, doc_count(&service, "articles").await);
    }

    #[tokio::test]
    async fn delete_after_create_leaves_no_document() {
        let service = service();
        let content = TestContentSource::create();

        service
            .apply_batch(
                "articles",
                vec![create("a", "en"), delete("a", "en")],
                &content,
            )
            .await
            .unwrap();

        assert_eq!(0, doc_count(&service, "articles").await);
    }

    #[tokio::test]
    async fn different_languages_are_distinct_documents() {
        let service = service();
        let content = TestContentSource::create();

        service
            .apply_batch(
                "articles",
                vec![create("a", "en"), create("a", "es")],
                &content,
            )
            .await
            .unwrap();

        assert_eq!(2, doc_count(&service, "articles").await);
    }

    #[tokio::test]
    async fn mapping_failure_skips_item_and_continues() {
        let service = service();
        let content = TestContentSource::create();

        let broken = QueueItem::new(
            "articles",
            TaskType::Create,
            Some(page_item("", "en", "Article")),
        )
        .unwrap();

        let outcome = service
            .apply_batch("articles", vec![broken, create("b", "en")], &content)
            .await
            .unwrap();

        assert_eq!(1, outcome.applied);
        assert_eq!(1, outcome.skipped);
        assert_eq!(1, doc_count(&service, "articles").await);
    }

    #[tokio::test]
    async fn publish_index_rebuilds_from_content_source() {
        let service = service();
        let content = TestContentSource::create();
        content.put(page_item("a", "en", "Article"));
        content.put(page_item("b", "en", "Article"));
        // Out of scope for the articles index; must not be rebuilt in.
        content.put(page_item("c", "en", "Event"));

        // Seed a document that the rebuild should sweep away.
        service
            .apply_batch("articles", vec![create("stale", "en")], &content)
            .await
            .unwrap();

        let outcome = service
            .apply_batch(
                "articles",
                vec![QueueItem::rebuild("articles").unwrap()],
                &content,
            )
            .await
            .unwrap();

        assert!(outcome.rebuilt);
        assert_eq!(2, outcome.applied);
        assert_eq!(2, doc_count(&service, "articles").await);
    }

    #[tokio::test]
    async fn reset_index_drops_all_documents() {
        let service = service();
        let content = TestContentSource::create();

        service
            .apply_batch("articles", vec![create("a", "en")], &content)
            .await
            .unwrap();

        service.reset_index("articles").await.unwrap();

        assert_eq!(0, doc_count(&service, "articles").await);
    }

    #[tokio::test]
    async fn unknown_index_is_rejected() {
        let service = service();
        let content = TestContentSource::create();

        let item = QueueItem::new(
            "missing",
            TaskType::Create,
            Some(page_item("a", "en", "Article")),
        )
        .unwrap();

        let err = service
            .apply_batch("missing", vec![item], &content)
            .await
            .unwrap_err();

        assert!(matches!(err, WriterError::UnknownIndex(name) if name == "missing"));
    }

    #[tokio::test]
    async fn snapshot_readers_do_not_see_later_commits() {
        let registry = Arc::new(crate::config::test_utils::articles_registry());
        let loader = Arc::new(crate::index::RamIndexLoader::new());
        let service = IndexWriterService::new(
            Arc::clone(&registry),
            Arc::new(StrategyRegistry::with_defaults()),
            Arc::clone(&loader) as Arc<dyn IndexLoader>,
        );
        let content = TestContentSource::create();

        service
            .apply_batch("articles", vec![create("a", "en")], &content)
            .await
            .unwrap();

        // Pin a snapshot over the same storage before the second commit.
        let schema = build_schema(
            registry.get("articles").unwrap(),
            &crate::strategy::DefaultContentStrategy,
        );
        let index = loader
            .load_index("articles", schema, OpenMode::CreateOrAppend)
            .unwrap();
        let reader = index
            .reader_builder()
            .reload_policy(tantivy::ReloadPolicy::Manual)
            .try_into()
            .unwrap();
        let snapshot = reader.searcher();

        service
            .apply_batch("articles", vec![create("b", "en")], &content)
            .await
            .unwrap();

        assert_eq!(1, snapshot.search(&AllQuery, &Count).unwrap());
        assert_eq!(2, doc_count(&service, "articles").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn writer_acquisition_is_serialized_per_index() {
        let service = Arc::new(service());
        let active = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];

        for _ in 0..4 {
            let service = Arc::clone(&service);
            let active = Arc::clone(&active);
            let overlapped = Arc::clone(&overlapped);

            handles.push(tokio::spawn(async move {
                service
                    .use_writer("articles", OpenMode::CreateOrAppend, |_writer| {
                        if active.fetch_add(1, Ordering::SeqCst) > 0 {
                            overlapped.fetch_add(1, Ordering::SeqCst);
                        }
                        std::thread::sleep(std::time::Duration::from_millis(20));
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
                    .unwrap();
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(0, overlapped.load(Ordering::SeqCst));
    }
}
