//! Data types shared by the in-memory index backends.

use serde::Serialize;

/// One searchable text field of a [`Document`].
#[derive(Debug, Clone, PartialEq)]
pub struct Content {
    /// Caller-chosen identifier, reported back in [`Position`]s.
    pub id: String,
    pub text: String,
    /// Importance of this field in `[0, 1]`.
    pub weight: f64,
}

impl Content {
    pub fn new(
        id: impl Into<String>,
        text: impl Into<String>,
        weight: f64,
    ) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            weight: weight.clamp(0.0, 1.0),
        }
    }
}

/// A document as handed to an index: an opaque id plus its contents.
///
/// Re-adding a document with an existing id replaces the stored one
/// wholesale. For the linear backend the order of `contents` matters:
/// put the most important field first.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub contents: Vec<Content>,
}

impl Document {
    pub fn new(id: impl Into<String>, contents: Vec<Content>) -> Self {
        Self {
            id: id.into(),
            contents,
        }
    }
}

/// Byte range of a match inside one content field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Position {
    pub content_id: String,
    pub start: usize,
    pub length: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeightedPosition {
    /// Weight inherited from the owning [`Content`].
    pub weight: f64,
    pub position: Position,
}

/// A normalized term and every place it occurs.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub content: String,
    pub positions: Vec<WeightedPosition>,
}

/// A ranked hit returned by [`crate::index::Index::find`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub id: String,
    pub score: f64,
    pub positions: Vec<WeightedPosition>,
}

/// Tunable cutoffs used by the index backends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchParams {
    /// Minimum fuzzy relevance for the linear backend.
    pub relevance_threshold: f64,
    /// Cheap prefix cutoff used by the inverted backend.
    pub prefix_threshold: f64,
    /// Stricter block-match cutoff used by the inverted backend.
    pub fuzzy_threshold: f64,
}

pub const DEFAULT_RELEVANCE_THRESHOLD: f64 = 0.32;
pub const DEFAULT_PREFIX_THRESHOLD: f64 = 0.6;
pub const DEFAULT_FUZZY_THRESHOLD: f64 = 0.6;

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            relevance_threshold: DEFAULT_RELEVANCE_THRESHOLD,
            prefix_threshold: DEFAULT_PREFIX_THRESHOLD,
            fuzzy_threshold: DEFAULT_FUZZY_THRESHOLD,
        }
    }
}

/// Sort results by descending score. Ties keep their incoming order.
pub(crate) fn sort_by_score(results: &mut [SearchResult]) {
    results.sort_by(|a, b| b.score.total_cmp(&a.score));
}
