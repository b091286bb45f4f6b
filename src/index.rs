use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use tantivy::merge_policy::NoMergePolicy;
use tantivy::schema::{self, FacetOptions, Field, Schema};
use tantivy::{Index, IndexWriter};
use thiserror::Error;

use crate::config::IndexDefinition;
use crate::strategy::IndexingStrategy;

#[derive(Debug, Error)]
pub enum IndexAccessError {
    #[error("storage for index {index} is inaccessible: {source}")]
    Storage {
        index: String,
        #[source]
        source: std::io::Error,
    },

    #[error("index {index} failed to open: {source}")]
    Engine {
        index: String,
        #[source]
        source: tantivy::TantivyError,
    },
}

/// How index storage is opened for a writer session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Open existing segments, creating the index when absent.
    CreateOrAppend,
    /// Truncate and start fresh. Used by resets and full rebuilds.
    Create,
}

/// Builds the schema for an index: system identity fields plus whatever
/// content fields its strategy contributes.
pub fn build_schema(definition: &IndexDefinition, strategy: &dyn IndexingStrategy) -> Schema {
    let mut builder = Schema::builder();

    strategy.configure_schema(definition.analyzer, &mut builder);

    // System fields. __id is the per-(guid, language) unique key used for
    // delete-then-add updates.
    builder.add_text_field("__id", schema::STRING | schema::STORED);
    builder.add_text_field("item_guid", schema::STRING | schema::STORED);
    builder.add_text_field("language", schema::STRING | schema::STORED);
    builder.add_text_field("content_type", schema::STRING | schema::STORED);
    builder.add_facet_field("facet", FacetOptions::default());

    builder.build()
}

pub trait IndexLoader: Send + Sync {
    fn load_index(
        &self,
        index_name: &str,
        schema: Schema,
        mode: OpenMode,
    ) -> Result<Index, IndexAccessError>;
}

/// Disk-backed storage: one directory per index name under a common root.
pub struct IndexStorage {
    root: PathBuf,
}

impl IndexStorage {
    pub fn new(root: impl Into<PathBuf>) -> IndexStorage {
        IndexStorage { root: root.into() }
    }

    fn index_dir(&self, index_name: &str) -> PathBuf {
        self.root.join(index_name)
    }
}

impl IndexLoader for IndexStorage {
    fn load_index(
        &self,
        index_name: &str,
        schema: Schema,
        mode: OpenMode,
    ) -> Result<Index, IndexAccessError> {
        let dir = self.index_dir(index_name);

        let storage_err = |source| IndexAccessError::Storage {
            index: index_name.into(),
            source,
        };
        let engine_err = |source| IndexAccessError::Engine {
            index: index_name.into(),
            source,
        };

        if mode == OpenMode::Create && dir.exists() {
            fs::remove_dir_all(&dir).map_err(storage_err)?;
        }

        if dir.join("meta.json").exists() {
            Index::open_in_dir(&dir).map_err(engine_err)
        } else {
            fs::create_dir_all(&dir).map_err(storage_err)?;
            Index::create_in_dir(&dir, schema).map_err(engine_err)
        }
    }
}

/// In-memory loader used by tests: indexes live in RAM and survive reopen
/// within the process, and `OpenMode::Create` swaps in a fresh one.
pub struct RamIndexLoader {
    indexes: Mutex<HashMap<String, Index>>,
}

impl RamIndexLoader {
    pub fn new() -> RamIndexLoader {
        RamIndexLoader {
            indexes: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for RamIndexLoader {
    fn default() -> Self {
        RamIndexLoader::new()
    }
}

impl IndexLoader for RamIndexLoader {
    fn load_index(
        &self,
        index_name: &str,
        schema: Schema,
        mode: OpenMode,
    ) -> Result<Index, IndexAccessError> {
        let mut indexes = self
            .indexes
            .lock()
            .expect("ram loader lock should not be poisoned");

        if mode == OpenMode::Create {
            indexes.remove(index_name);
        }

        let index = indexes
            .entry(index_name.into())
            .or_insert_with(|| Index::create_in_ram(schema));

        Ok(index.clone())
    }
}

pub trait IndexExt {
    fn default_writer(&self) -> tantivy::Result<IndexWriter>;

    fn id_field(&self) -> Field;
}

impl IndexExt for Index {
    fn default_writer(&self) -> tantivy::Result<IndexWriter> {
        let writer = self.writer(100_000_000)?;

        let merge_policy = NoMergePolicy;
        writer.set_merge_policy(Box::new(merge_policy));

        Ok(writer)
    }

    fn id_field(&self) -> Field {
        self.schema()
            .get_field("__id")
            .expect("__id field should be present")
    }
}
