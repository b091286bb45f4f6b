use std::cmp::Reverse;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tantivy::collector::{Count, FacetCollector, TopDocs};
use tantivy::query::{Query, QueryParser};
use tantivy::schema::{Field, FieldType};
use tantivy::{Index, Searcher};
use thiserror::Error;

use crate::json;
use crate::writer::{IndexWriterService, WriterError};

#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Writer(#[from] WriterError),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("page and page size must be at least 1")]
    InvalidPage,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,

    /// 1-based page number.
    pub page: usize,
    pub page_size: usize,

    /// Facet dimension to aggregate over the result set, e.g. `content_type`.
    pub facet: Option<String>,
}

impl SearchRequest {
    pub fn new(query: &str) -> SearchRequest {
        SearchRequest {
            query: query.into(),
            page: 1,
            page_size: 10,
            facet: None,
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct FacetValue {
    pub label: String,
    pub value: u64,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct SearchHit {
    pub doc: json::Value,
    pub score: f32,
}

#[derive(Debug, Serialize)]
pub struct SearchResults<T> {
    pub query: String,
    pub hits: Vec<T>,
    pub total_hits: usize,
    pub total_pages: usize,
    pub page: usize,
    pub page_size: usize,
    pub facet: Option<String>,
    pub facet_values: Option<Vec<FacetValue>>,
}

/// Read side of the pipeline: executes queries against a named index's
/// searcher snapshot and materializes typed results.
pub struct SearchService {
    writer: Arc<IndexWriterService>,
}

impl SearchService {
    pub fn new(writer: Arc<IndexWriterService>) -> SearchService {
        SearchService { writer }
    }

    pub async fn search(
        &self,
        index_name: &str,
        request: &SearchRequest,
    ) -> Result<SearchResults<SearchHit>, SearchError> {
        self.search_with(index_name, request, |doc, score| SearchHit { doc, score })
            .await
    }

    /// Executes the query and maps each raw stored document through the
    /// given projection.
    pub async fn search_with<T, P>(
        &self,
        index_name: &str,
        request: &SearchRequest,
        project: P,
    ) -> Result<SearchResults<T>, SearchError>
    where
        T: Send,
        P: Fn(json::Value, f32) -> T + Send + Sync,
    {
        if request.page == 0 || request.page_size == 0 {
            return Err(SearchError::InvalidPage);
        }

        match &request.facet {
            Some(facet_name) => {
                let root = format!("/{facet_name}");

                self.writer
                    .use_searcher_with_facets(
                        index_name,
                        |index: &Index, searcher: &Searcher, facet_field: Field| {
                            let query = parse_query(index, &request.query)?;

                            let mut facet_collector = FacetCollector::for_field(facet_field);
                            facet_collector.add_facet(root.as_str());

                            let (top_docs, total_hits, facet_counts) = searcher
                                .search(
                                    &query,
                                    &(top_docs_collector(request), Count, facet_collector),
                                )
                                .map_err(|source| search_engine_err(index_name, source))?;

                            let mut facet_values = facet_counts
                                .get(root.as_str())
                                .map(|(facet, value)| FacetValue {
                                    label: facet_label(&facet.to_string()),
                                    value,
                                })
                                .collect::<Vec<_>>();

                            // Descending count; ties broken by label for
                            // deterministic output.
                            facet_values
                                .sort_by_key(|fv| (Reverse(fv.value), fv.label.clone()));

                            let hits =
                                materialize(index, searcher, index_name, top_docs, &project)?;

                            Ok(results(request, hits, total_hits, Some(facet_values)))
                        },
                    )
                    .await
            }
            None => {
                self.writer
                    .use_searcher(index_name, |index: &Index, searcher: &Searcher| {
                        let query = parse_query(index, &request.query)?;

                        let (top_docs, total_hits) = searcher
                            .search(&query, &(top_docs_collector(request), Count))
                            .map_err(|source| search_engine_err(index_name, source))?;

                        let hits = materialize(index, searcher, index_name, top_docs, &project)?;

                        Ok(results(request, hits, total_hits, None))
                    })
                    .await
            }
        }
    }
}

fn top_docs_collector(request: &SearchRequest) -> TopDocs {
    TopDocs::with_limit(request.page_size).and_offset((request.page - 1) * request.page_size)
}

fn parse_query(index: &Index, query_text: &str) -> Result<Box<dyn Query>, SearchError> {
    let schema = index.schema();

    let default_fields = schema
        .fields()
        .filter_map(|(field, entry)| {
            if !entry.is_indexed() {
                return None;
            }
            match entry.field_type() {
                FieldType::Str(_) => Some(field),
                _ => None,
            }
        })
        .collect::<Vec<Field>>();

    QueryParser::for_index(index, default_fields)
        .parse_query(query_text)
        .map_err(|err| SearchError::InvalidQuery(err.to_string()))
}

fn search_engine_err(index_name: &str, source: tantivy::TantivyError) -> SearchError {
    SearchError::Writer(WriterError::Engine {
        index: index_name.into(),
        source,
    })
}

fn materialize<T>(
    index: &Index,
    searcher: &Searcher,
    index_name: &str,
    top_docs: Vec<(f32, tantivy::DocAddress)>,
    project: &impl Fn(json::Value, f32) -> T,
) -> Result<Vec<T>, SearchError> {
    let schema = index.schema();

    top_docs
        .into_iter()
        .map(|(score, address)| {
            let document = searcher
                .doc(address)
                .map_err(|source| search_engine_err(index_name, source))?;

            let named_doc = schema.to_named_doc(&document);
            let doc = json::to_value(named_doc)
                .map_err(|err| SearchError::InvalidQuery(err.to_string()))?;

            Ok(project(doc, score))
        })
        .collect()
}

fn facet_label(facet_path: &str) -> String {
    facet_path
        .rsplit('/')
        .next()
        .unwrap_or(facet_path)
        .to_string()
}

fn results<T>(
    request: &SearchRequest,
    hits: Vec<T>,
    total_hits: usize,
    facet_values: Option<Vec<FacetValue>>,
) -> SearchResults<T> {
    SearchResults {
        query: request.query.clone(),
        hits,
        total_hits,
        total_pages: (total_hits + request.page_size - 1) / request.page_size,
        page: request.page,
        page_size: request.page_size,
        facet: request.facet.clone(),
        facet_values,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_utils::page_item;
    use crate::model::{QueueItem, TaskType};
    use crate::source::test_utils::TestContentSource;
    use crate::writer::test_utils::service;

    async fn seeded_service(titles: &[(&str, &str, &str)]) -> Arc<IndexWriterService> {
        let writer = Arc::new(service());
        let content = TestContentSource::create();

        let items = titles
            .iter()
            .map(|(guid, title, content_type)| {
                let mut item = page_item(guid, "en", content_type);
                item.display_name = (*title).into();
                QueueItem::new("articles", TaskType::Create, Some(item)).unwrap()
            })
            .collect();

        writer.apply_batch("articles", items, &content).await.unwrap();

        writer
    }

    #[tokio::test]
    async fn pagination_computes_total_pages_and_tolerates_overflow() {
        let titles = (0..23)
            .map(|i| (format!("g{i}"), format!("Coffee guide {i}")))
            .collect::<Vec<_>>();
        let seed = titles
            .iter()
            .map(|(guid, title)| (guid.as_str(), title.as_str(), "Article"))
            .collect::<Vec<_>>();
        let writer = seeded_service(&seed).await;
        let search = SearchService::new(writer);

        let mut request = SearchRequest::new("coffee");
        request.page_size = 10;

        let first = search.search("articles", &request).await.unwrap();
        assert_eq!(23, first.total_hits);
        assert_eq!(3, first.total_pages);
        assert_eq!(10, first.hits.len());

        request.page = 3;
        let last = search.search("articles", &request).await.unwrap();
        assert_eq!(3, last.hits.len());

        request.page = 4;
        let beyond = search.search("articles", &request).await.unwrap();
        assert_eq!(0, beyond.hits.len());
        assert_eq!(3, beyond.total_pages);
    }

    #[tokio::test]
    async fn page_zero_is_rejected() {
        let writer = seeded_service(&[("a", "Coffee", "Article")]).await;
        let search = SearchService::new(writer);

        let mut request = SearchRequest::new("coffee");
        request.page = 0;

        let err = search.search("articles", &request).await.unwrap_err();

        assert!(matches!(err, SearchError::InvalidPage));
    }

    #[tokio::test]
    async fn facets_are_computed_over_the_result_set() {
        let writer = seeded_service(&[
            ("a", "Coffee roasting", "Article"),
            ("b", "Coffee brewing", "Article"),
            ("c", "Coffee history", "Article"),
            ("d", "Coffee fair", "Event"),
            ("e", "Coffee blogging", "Blog"),
            // Does not match the query; must not show up in facet counts.
            ("f", "Tea compendium", "Article"),
        ])
        .await;
        let search = SearchService::new(writer);

        let mut request = SearchRequest::new("coffee");
        request.facet = Some("content_type".into());

        let found = search.search("articles", &request).await.unwrap();

        assert_eq!(5, found.total_hits);
        assert_eq!(
            Some(vec![
                FacetValue {
                    label: "Article".into(),
                    value: 3
                },
                // Equal counts fall back to label order.
                FacetValue {
                    label: "Blog".into(),
                    value: 1
                },
                FacetValue {
                    label: "Event".into(),
                    value: 1
                },
            ]),
            found.facet_values
        );
    }

    #[tokio::test]
    async fn reset_index_yields_zero_hits_and_zero_pages() {
        let writer = seeded_service(&[("a", "Coffee", "Article")]).await;
        writer.reset_index("articles").await.unwrap();
        let search = SearchService::new(writer);

        let found = search
            .search("articles", &SearchRequest::new("coffee"))
            .await
            .unwrap();

        assert_eq!(0, found.total_hits);
        assert_eq!(0, found.total_pages);
        assert!(found.hits.is_empty());
    }

    #[tokio::test]
    async fn projection_maps_hits_to_typed_results() {
        let writer = seeded_service(&[("a", "Coffee atlas", "Article")]).await;
        let search = SearchService::new(writer);

        let found = search
            .search_with("articles", &SearchRequest::new("coffee"), |doc, _score| {
                doc["title"][0].as_str().unwrap_or_default().to_string()
            })
            .await
            .unwrap();

        assert_eq!(vec!["Coffee atlas".to_string()], found.hits);
    }

    #[tokio::test]
    async fn malformed_query_is_an_invalid_query_error() {
        let writer = seeded_service(&[("a", "Coffee", "Article")]).await;
        let search = SearchService::new(writer);

        let err = search
            .search("articles", &SearchRequest::new("title:["))
            .await
            .unwrap_err();

        assert!(matches!(err, SearchError::InvalidQuery(_)));
    }

    #[tokio::test]
    async fn unknown_index_is_rejected() {
        let writer = Arc::new(service());
        let search = SearchService::new(writer);

        let err = search
            .search("missing", &SearchRequest::new("coffee"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SearchError::Writer(WriterError::UnknownIndex(name)) if name == "missing"
        ));
    }
}
