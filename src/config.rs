use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::json;
use crate::model::IndexedItemModel;
use crate::strategy::StrategyRegistry;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("duplicate index name: {0}")]
    DuplicateIndexName(String),

    #[error("index {0} has no included paths")]
    EmptyPaths(String),

    #[error("index {0} has no languages")]
    EmptyLanguages(String),

    #[error("index {index} references unknown strategy {strategy}")]
    UnknownStrategy { index: String, strategy: String },

    #[error("unable to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("unable to parse config: {0}")]
    Parse(#[from] json::Error),
}

/// Analyzer applied to the text fields of an index. Maps onto the tokenizers
/// registered with the underlying engine.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum AnalyzerKind {
    #[default]
    Standard,
    EnglishStemming,
    Keyword,
}

impl AnalyzerKind {
    pub fn tokenizer_name(&self) -> &'static str {
        match self {
            AnalyzerKind::Standard => "default",
            AnalyzerKind::EnglishStemming => "en_stem",
            AnalyzerKind::Keyword => "raw",
        }
    }
}

/// Rule selecting which content belongs in an index: an alias path pattern
/// plus the content types eligible under it. A trailing `%` or `*` makes the
/// pattern a prefix match; an empty content type set admits every type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IncludedPath {
    pub path: String,

    #[serde(default)]
    pub content_type_names: Vec<String>,

    #[serde(default)]
    pub identifier: Option<String>,
}

impl IncludedPath {
    pub fn matches_path(&self, candidate: &str) -> bool {
        let pattern = self.path.trim_end_matches('/');
        let candidate = candidate.trim_end_matches('/');

        if let Some(prefix) = pattern.strip_suffix('%').or_else(|| pattern.strip_suffix('*')) {
            let prefix = prefix.trim_end_matches('/');
            candidate == prefix || candidate.starts_with(&format!("{prefix}/"))
        } else {
            candidate == pattern
        }
    }

    pub fn matches_content_type(&self, content_type_name: &str) -> bool {
        self.content_type_names.is_empty()
            || self
                .content_type_names
                .iter()
                .any(|name| name == content_type_name)
    }
}

/// Configuration of one named index, loaded at startup and immutable for the
/// process lifetime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub index_name: String,
    pub channel_name: String,
    pub language_names: Vec<String>,
    pub identifier: i64,
    pub paths: Vec<IncludedPath>,

    #[serde(default = "default_strategy_name")]
    pub strategy: String,

    #[serde(default)]
    pub analyzer: AnalyzerKind,

    /// Opaque identifier external tooling uses to trigger a full rebuild.
    #[serde(default)]
    pub rebuild_hook: Option<String>,
}

fn default_strategy_name() -> String {
    "default".into()
}

impl IndexDefinition {
    fn matches_language(&self, language_name: &str) -> bool {
        self.language_names.iter().any(|l| l == language_name)
    }

    fn matching_path(&self, content_type_name: &str, path: &str) -> bool {
        self.paths
            .iter()
            .any(|p| p.matches_content_type(content_type_name) && p.matches_path(path))
    }

    /// Whether a changed web page item belongs in this index.
    pub fn matches_web_page(&self, item: &IndexedItemModel) -> bool {
        let (channel, path) = match (&item.channel_name, &item.path) {
            (Some(channel), Some(path)) => (channel, path),
            _ => return false,
        };

        channel == &self.channel_name
            && self.matches_language(&item.language_name)
            && self.matching_path(&item.content_type_name, path)
    }

    /// Whether a changed reusable content item belongs in this index.
    /// Content items have no channel or tree path; eligibility is decided by
    /// content type and language alone.
    pub fn matches_content_item(&self, item: &IndexedItemModel) -> bool {
        self.matches_language(&item.language_name)
            && self
                .paths
                .iter()
                .any(|p| p.matches_content_type(&item.content_type_name))
    }
}

#[derive(Deserialize, Debug)]
struct RegistryConfig {
    indexes: Vec<IndexDefinition>,
}

/// Process-scoped set of registered index definitions. Validated once at
/// load; never mutated afterwards.
#[derive(Debug)]
pub struct IndexRegistry {
    definitions: Vec<IndexDefinition>,
}

impl IndexRegistry {
    pub fn from_json(
        config: json::Value,
        strategies: &StrategyRegistry,
    ) -> Result<IndexRegistry, ConfigError> {
        let config: RegistryConfig = json::from_value(config)?;

        let mut definitions: Vec<IndexDefinition> = Vec::new();

        for definition in config.indexes {
            if definitions
                .iter()
                .any(|existing| existing.index_name == definition.index_name)
            {
                return Err(ConfigError::DuplicateIndexName(definition.index_name));
            }

            if definition.paths.is_empty() {
                return Err(ConfigError::EmptyPaths(definition.index_name));
            }

            if definition.language_names.is_empty() {
                return Err(ConfigError::EmptyLanguages(definition.index_name));
            }

            if strategies.get(&definition.strategy).is_none() {
                return Err(ConfigError::UnknownStrategy {
                    index: definition.index_name,
                    strategy: definition.strategy,
                });
            }

            definitions.push(definition);
        }

        Ok(IndexRegistry { definitions })
    }

    pub fn from_file(
        path: impl AsRef<Path>,
        strategies: &StrategyRegistry,
    ) -> Result<IndexRegistry, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: json::Value = json::from_str(&content)?;
        IndexRegistry::from_json(config, strategies)
    }

    pub fn get(&self, index_name: &str) -> Option<&IndexDefinition> {
        self.definitions
            .iter()
            .find(|definition| definition.index_name == index_name)
    }

    pub fn definitions(&self) -> impl Iterator<Item = &IndexDefinition> {
        self.definitions.iter()
    }
}
