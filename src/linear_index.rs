use std::collections::BTreeMap;

use crate::{
    fuzzy::{self, TokenizedString},
    index::{BackendKind, FindError, Index},
    types::{
        Document,
        Position,
        SearchParams,
        SearchResult,
        WeightedPosition,
        sort_by_score,
    },
};

/// One content field, pre-tokenized for matching.
#[derive(Debug, Clone)]
struct Tag {
    content_id: String,
    weight: f64,
    text: TokenizedString,
}

/// Brute-force fuzzy index.
///
/// Every query is matched against every stored tag. Tags of a document
/// are tried in the order the caller supplied them and the first one
/// reaching the relevance threshold decides the document's score, so
/// callers must put the most important tag first.
#[derive(Debug, Default)]
pub struct LinearIndex {
    documents: BTreeMap<String, Vec<Tag>>,
    params: SearchParams,
}

impl LinearIndex {
    pub fn new(params: SearchParams) -> Self {
        Self {
            documents: BTreeMap::new(),
            params,
        }
    }

    fn first_relevant_tag(
        &self,
        query: &TokenizedString,
        tags: &[Tag],
    ) -> Option<(f64, Vec<WeightedPosition>)> {
        tags.iter().find_map(|tag| {
            let (score, hits) = fuzzy::scored_match(query, &tag.text);
            if score < self.params.relevance_threshold {
                return None;
            }
            let ranges = if hits.is_empty() {
                vec![(0, tag.text.original().len())]
            } else {
                hits
            };
            let positions = ranges
                .into_iter()
                .map(|(start, length)| WeightedPosition {
                    weight: tag.weight,
                    position: Position {
                        content_id: tag.content_id.clone(),
                        start,
                        length,
                    },
                })
                .collect();
            Some((score, positions))
        })
    }
}

impl Index for LinearIndex {
    fn backend(&self) -> BackendKind {
        BackendKind::Linear
    }

    fn size(&self) -> usize {
        self.documents.len()
    }

    fn add_or_update(&mut self, documents: Vec<Document>) {
        for doc in documents {
            let tags = doc
                .contents
                .into_iter()
                .map(|content| Tag {
                    text: TokenizedString::new(&content.text),
                    content_id: content.id,
                    weight: content.weight,
                })
                .collect();
            self.documents.insert(doc.id, tags);
        }
    }

    fn delete(&mut self, ids: &[String]) -> usize {
        ids.iter()
            .filter(|id| self.documents.remove(id.as_str()).is_some())
            .count()
    }

    fn find(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchResult>, FindError> {
        let query = TokenizedString::new(query);
        if query.is_empty() {
            return Err(FindError::EmptyQuery);
        }
        if self.documents.is_empty() {
            return Err(FindError::EmptyIndex);
        }

        let mut results: Vec<SearchResult> = self
            .documents
            .iter()
            .filter_map(|(id, tags)| {
                let (score, positions) = self.first_relevant_tag(&query, tags)?;
                Some(SearchResult {
                    id: id.clone(),
                    score,
                    positions,
                })
            })
            .collect();

        sort_by_score(&mut results);
        if max_results > 0 {
            results.truncate(max_results);
        }
        Ok(results)
    }

    fn clear(&mut self) {
        self.documents.clear();
    }

    fn search_params(&self) -> SearchParams {
        self.params
    }

    fn set_search_params(&mut self, params: SearchParams) {
        self.params = params;
    }
}
