use std::collections::BTreeSet;

use tracing::debug;

use crate::{
    index::{BackendKind, FindError, Index},
    inverted_index::InvertedIndex,
    tokenizer,
    types::{Document, SearchParams, SearchResult},
};

/// [`Index`] backend ranking documents by TF-IDF over fuzzy term matches.
#[derive(Debug, Default)]
pub struct InvertedIndexSearch {
    index: InvertedIndex,
    params: SearchParams,
}

impl InvertedIndexSearch {
    pub fn new(params: SearchParams) -> Self {
        Self {
            index: InvertedIndex::new(),
            params,
        }
    }

    pub fn inverted_index(&self) -> &InvertedIndex {
        &self.index
    }
}

impl Index for InvertedIndexSearch {
    fn backend(&self) -> BackendKind {
        BackendKind::Inverted
    }

    fn size(&self) -> usize {
        self.index.number_documents()
    }

    fn add_or_update(&mut self, documents: Vec<Document>) {
        if documents.is_empty() {
            return;
        }
        for doc in &documents {
            let tokens = tokenizer::extract_document_tokens(doc);
            self.index.add_document(&doc.id, tokens);
        }
        self.index.build_inverted_index();
        debug!(
            documents = documents.len(),
            build = ?self.index.last_build(),
            "updated inverted index"
        );
    }

    fn delete(&mut self, ids: &[String]) -> usize {
        let removed: u32 =
            ids.iter().map(|id| self.index.remove_document(id)).sum();
        if removed > 0 {
            self.index.build_inverted_index();
        }
        removed as usize
    }

    fn find(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, FindError> {
        let terms: Vec<String> = tokenizer::extract_content("query", query, 1.0)
            .into_iter()
            .map(|token| token.content)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if terms.is_empty() {
            return Err(FindError::EmptyQuery);
        }
        if self.index.number_documents() == 0 {
            return Err(FindError::EmptyIndex);
        }

        let mut results: Vec<SearchResult> = self
            .index
            .find_matching_documents_approximately(
                &terms,
                self.params.prefix_threshold,
                self.params.fuzzy_threshold,
            )
            .into_iter()
            .map(|doc| SearchResult {
                id: doc.id,
                score: doc.score,
                positions: doc.positions,
            })
            .collect();

        if max_results > 0 {
            results.truncate(max_results);
        }
        Ok(results)
    }

    fn clear(&mut self) {
        self.index.clear_inverted_index();
    }

    fn search_params(&self) -> SearchParams {
        self.params
    }

    fn set_search_params(&mut self, params: SearchParams) {
        self.params = params;
    }
}
