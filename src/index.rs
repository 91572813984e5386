//! The pluggable in-memory index interface and its backends.

use std::{
    collections::{HashMap, hash_map::Entry},
    fmt,
    str::FromStr,
};

use tracing::debug;

use crate::{
    error::{Error, Result},
    inverted_search::InvertedIndexSearch,
    linear_index::LinearIndex,
    types::{Document, SearchParams, SearchResult},
};

/// Why a query produced no result list at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FindError {
    #[error("query is empty")]
    EmptyQuery,
    #[error("index is empty")]
    EmptyIndex,
}

/// Which matching strategy backs an [`Index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Fuzzy-match every document on every query.
    Linear,
    /// Term dictionary with TF-IDF ranking.
    Inverted,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::Inverted => "inverted",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linear" => Ok(Self::Linear),
            "inverted" => Ok(Self::Inverted),
            other => Err(Error::Config(format!(
                "unknown index backend '{other}' (expected linear or inverted)"
            ))),
        }
    }
}

/// A searchable collection of [`Document`]s.
pub trait Index: Send {
    fn backend(&self) -> BackendKind;

    /// Number of documents currently indexed.
    fn size(&self) -> usize;

    /// Insert documents, replacing any stored document with the same id.
    fn add_or_update(&mut self, documents: Vec<Document>);

    /// Remove documents by id. Returns how many existed.
    fn delete(&mut self, ids: &[String]) -> usize;

    /// Documents without contents are deleted, the rest are added or
    /// updated. Returns the number of deleted documents.
    fn update_documents(&mut self, documents: Vec<Document>) -> usize {
        let (empty, filled): (Vec<_>, Vec<_>) = documents
            .into_iter()
            .partition(|doc| doc.contents.is_empty());
        let ids: Vec<String> = empty.into_iter().map(|doc| doc.id).collect();
        let deleted = self.delete(&ids);
        self.add_or_update(filled);
        deleted
    }

    /// Rank documents against `query`. `max_results == 0` means no limit.
    fn find(
        &self,
        query: &str,
        max_results: usize,
    ) -> std::result::Result<Vec<SearchResult>, FindError>;

    fn clear(&mut self);

    fn search_params(&self) -> SearchParams;

    fn set_search_params(&mut self, params: SearchParams);
}

pub fn create_index(kind: BackendKind, params: SearchParams) -> Box<dyn Index> {
    match kind {
        BackendKind::Linear => Box::new(LinearIndex::new(params)),
        BackendKind::Inverted => Box::new(InvertedIndexSearch::new(params)),
    }
}

/// Name under which an index is registered in a [`SearchService`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexId(pub String);

impl From<&str> for IndexId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Owner of every named index in the process.
#[derive(Default)]
pub struct SearchService {
    indexes: HashMap<IndexId, Box<dyn Index>>,
    params: SearchParams,
}

impl SearchService {
    pub fn new(params: SearchParams) -> Self {
        Self {
            indexes: HashMap::new(),
            params,
        }
    }

    /// Fetch the index named `id`, creating it with `kind` on first use.
    ///
    /// Asking for an existing index with a different backend is an
    /// error rather than a silent fallback.
    pub fn get_or_create(
        &mut self,
        id: IndexId,
        kind: BackendKind,
    ) -> Result<&mut dyn Index> {
        match self.indexes.entry(id) {
            Entry::Occupied(entry) => {
                if entry.get().backend() != kind {
                    return Err(Error::BackendMismatch {
                        id: entry.key().to_string(),
                        existing: entry.get().backend().as_str(),
                        requested: kind.as_str(),
                    });
                }
                Ok(entry.into_mut().as_mut())
            }
            Entry::Vacant(entry) => {
                debug!(index = %entry.key(), backend = %kind, "creating index");
                Ok(entry.insert(create_index(kind, self.params)).as_mut())
            }
        }
    }

    pub fn get(&self, id: &IndexId) -> Option<&dyn Index> {
        self.indexes.get(id).map(|index| index.as_ref())
    }

    pub fn remove(&mut self, id: &IndexId) -> bool {
        self.indexes.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }
}

impl fmt::Debug for SearchService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SearchService")
            .field("indexes", &self.indexes.len())
            .field("params", &self.params)
            .finish()
    }
}
