//! Term dictionary with a lazily maintained TF-IDF cache.
//!
//! Mutations only touch the dictionary and mark the affected terms
//! dirty. [`InvertedIndex::build_inverted_index`] brings the cache up to
//! date: when the number of documents is unchanged since the previous
//! build only the dirty terms are rescored, otherwise every term is.
//!
//! The incremental path assumes a term's document frequency can only
//! change when the term itself was touched. A batch that removes one
//! document and adds another between two builds keeps the document
//! count, so only the touched terms are rescored; that is accepted as
//! an approximation.

use std::collections::{HashMap, HashSet};

use tracing::trace;

use crate::{
    fuzzy::{self, TokenizedString},
    types::{Token, WeightedPosition},
};

/// Every occurrence of one term in one document.
pub type Posting = Vec<WeightedPosition>;

/// Document id to posting, for a single term.
pub type PostingList = HashMap<String, Posting>;

#[derive(Debug, Clone, PartialEq)]
pub struct TfidfResult {
    pub document_id: String,
    pub posting: Posting,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildKind {
    /// Only dirty terms were rescored.
    Incremental,
    /// Every term was rescored because the document count changed.
    Full,
}

/// A document reached by at least one matching term.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedDocument {
    pub id: String,
    pub score: f64,
    pub positions: Vec<WeightedPosition>,
}

#[derive(Debug, Default)]
pub struct InvertedIndex {
    dictionary: HashMap<String, PostingList>,
    /// Total number of token positions per document.
    doc_length: HashMap<String, usize>,
    tfidf_cache: HashMap<String, Vec<TfidfResult>>,
    terms_to_be_updated: HashSet<String>,
    num_docs_from_last_update: usize,
    is_index_built: bool,
    last_build: Option<BuildKind>,
}

impl InvertedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index `tokens` under `id`, replacing any previous version.
    ///
    /// Terms are expected to be unique within `tokens`; a repeated term
    /// overwrites the earlier posting.
    pub fn add_document(&mut self, id: &str, tokens: Vec<Token>) {
        if self.doc_length.contains_key(id) {
            self.remove_document(id);
        }

        let mut length = 0;
        for token in tokens {
            length += token.positions.len();
            self.dictionary
                .entry(token.content.clone())
                .or_default()
                .insert(id.to_string(), token.positions);
            self.terms_to_be_updated.insert(token.content);
        }
        self.doc_length.insert(id.to_string(), length);
        self.is_index_built = false;
    }

    /// Remove a document. Returns 1 if it was indexed, 0 otherwise.
    pub fn remove_document(&mut self, id: &str) -> u32 {
        if self.doc_length.remove(id).is_none() {
            return 0;
        }

        let dirty = &mut self.terms_to_be_updated;
        self.dictionary.retain(|term, postings| {
            if postings.remove(id).is_some() {
                dirty.insert(term.clone());
            }
            !postings.is_empty()
        });
        self.is_index_built = false;
        1
    }

    /// Bring the TF-IDF cache up to date.
    pub fn build_inverted_index(&mut self) {
        let num_docs = self.doc_length.len();
        let kind = if num_docs == self.num_docs_from_last_update {
            BuildKind::Incremental
        } else {
            BuildKind::Full
        };

        let terms: Vec<String> = match kind {
            BuildKind::Incremental => self.terms_to_be_updated.drain().collect(),
            BuildKind::Full => {
                self.terms_to_be_updated.clear();
                self.tfidf_cache.clear();
                self.dictionary.keys().cloned().collect()
            }
        };

        trace!(?kind, terms = terms.len(), num_docs, "rebuilding tf-idf cache");
        for term in terms {
            match self.dictionary.get(&term) {
                Some(postings) => {
                    let scores = self.score_term(postings, num_docs);
                    self.tfidf_cache.insert(term, scores);
                }
                None => {
                    self.tfidf_cache.remove(&term);
                }
            }
        }

        self.num_docs_from_last_update = num_docs;
        self.is_index_built = true;
        self.last_build = Some(kind);
    }

    fn score_term(
        &self,
        postings: &PostingList,
        num_docs: usize,
    ) -> Vec<TfidfResult> {
        let idf = 1.0
            + ((1.0 + num_docs as f64) / (1.0 + postings.len() as f64)).ln();

        let mut results: Vec<TfidfResult> = postings
            .iter()
            .map(|(doc_id, posting)| {
                let length = self.doc_length.get(doc_id).copied().unwrap_or(0);
                let weight_sum: f64 = posting.iter().map(|p| p.weight).sum();
                let tf = if length == 0 {
                    0.0
                } else {
                    weight_sum / length as f64
                };
                TfidfResult {
                    document_id: doc_id.clone(),
                    posting: posting.clone(),
                    score: tf * idf,
                }
            })
            .collect();
        results.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        results
    }

    /// Score documents whose terms approximately match any query term.
    ///
    /// Each index term is compared with the query terms in order and
    /// contributes its TF-IDF scores once, for the first query term it
    /// matches, even if later query terms would match it too.
    pub fn find_matching_documents_approximately(
        &self,
        query_terms: &[String],
        prefix_threshold: f64,
        block_threshold: f64,
    ) -> Vec<MatchedDocument> {
        let queries: Vec<TokenizedString> = query_terms
            .iter()
            .map(|t| TokenizedString::new(t))
            .collect();

        let mut accumulated: HashMap<&str, (f64, Vec<WeightedPosition>)> =
            HashMap::new();

        for (term, scores) in &self.tfidf_cache {
            let candidate = TokenizedString::new(term);
            let matched = queries.iter().any(|query| {
                fuzzy::is_relevant_approximately(
                    query,
                    &candidate,
                    prefix_threshold,
                    block_threshold,
                )
            });
            if !matched {
                continue;
            }
            for result in scores {
                let entry = accumulated
                    .entry(result.document_id.as_str())
                    .or_insert_with(|| (0.0, Vec::new()));
                entry.0 += result.score;
                entry.1.extend(result.posting.iter().cloned());
            }
        }

        let mut documents: Vec<MatchedDocument> = accumulated
            .into_iter()
            .map(|(id, (score, positions))| MatchedDocument {
                id: id.to_string(),
                score,
                positions,
            })
            .collect();
        documents.sort_by(|a, b| {
            b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id))
        });
        documents
    }

    pub fn find_term(&self, term: &str) -> Option<&PostingList> {
        self.dictionary.get(term)
    }

    /// Cached scores for `term`; empty if unknown or never built.
    pub fn get_tfidf(&self, term: &str) -> &[TfidfResult] {
        self.tfidf_cache.get(term).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn clear_inverted_index(&mut self) {
        self.dictionary.clear();
        self.doc_length.clear();
        self.tfidf_cache.clear();
        self.terms_to_be_updated.clear();
        self.num_docs_from_last_update = 0;
        self.is_index_built = false;
        self.last_build = None;
    }

    pub fn number_documents(&self) -> usize {
        self.doc_length.len()
    }

    pub fn number_terms(&self) -> usize {
        self.dictionary.len()
    }

    pub fn is_index_built(&self) -> bool {
        self.is_index_built
    }

    pub fn dirty_terms(&self) -> &HashSet<String> {
        &self.terms_to_be_updated
    }

    pub fn last_build(&self) -> Option<BuildKind> {
        self.last_build
    }
}
