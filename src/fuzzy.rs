//! Fuzzy relevance between a query and a candidate text.
//!
//! Every primitive works on [`TokenizedString`]s so that case,
//! punctuation and camel case never influence a score. The composable
//! ratios ([`token_set_ratio`], [`token_sort_ratio`], [`partial_ratio`],
//! [`weighted_ratio`]) return values in `[0, 1]`; [`relevance`] blends
//! the weighted ratio with a prefix/acronym bonus so that typing the
//! start of a title is never outranked by bag-of-words overlap.

use std::collections::BTreeSet;

use crate::{
    sequence_matcher::{self, SequenceMatcher},
    tokenizer::{self, Word},
};

/// Score for a query character that extends a prefix run.
const PREFIX_CHAR_SCORE: f64 = 1.0;
/// Score for a query character that lands on the front of a later word.
const FRONT_OF_WORD_SCORE: f64 = 0.8;

/// Penalty applied to the token based ratios.
const TOKEN_RATIO_SCALE: f64 = 0.95;
/// Above this length ratio partial ratios take over from full ratios.
const PARTIAL_LENGTH_RATIO: f64 = 1.5;
/// Above this length ratio partial ratios are penalized harder.
const LONG_LENGTH_RATIO: f64 = 8.0;

/// Text split into normalized words, remembering the original.
#[derive(Debug, Clone)]
pub struct TokenizedString {
    original: String,
    words: Vec<Word>,
    joined: String,
}

impl TokenizedString {
    pub fn new(text: &str) -> Self {
        let words = tokenizer::split_words(text);
        let joined = words
            .iter()
            .map(|w| w.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        Self {
            original: text.to_string(),
            words,
            joined,
        }
    }

    pub fn original(&self) -> &str {
        &self.original
    }

    pub fn words(&self) -> &[Word] {
        &self.words
    }

    /// Normalized words joined with single spaces.
    pub fn joined(&self) -> &str {
        &self.joined
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    fn token_set(&self) -> BTreeSet<&str> {
        self.words.iter().map(|w| w.text.as_str()).collect()
    }
}

fn ratio_fn(partial: bool) -> fn(&str, &str) -> f64 {
    if partial {
        partial_ratio
    } else {
        sequence_matcher::ratio
    }
}

/// Best ratio of the shorter string against equally long windows of
/// the longer one, each window aligned on a matching block.
pub fn partial_ratio(a: &str, b: &str) -> f64 {
    let (shorter, longer) = if a.chars().count() <= b.chars().count() {
        (a, b)
    } else {
        (b, a)
    };
    let short_len = shorter.chars().count();
    if short_len == 0 {
        return 0.0;
    }

    let longer_chars: Vec<char> = longer.chars().collect();
    let mut best: f64 = 0.0;
    for block in SequenceMatcher::new(shorter, longer).matching_blocks() {
        let start = block.b_start.saturating_sub(block.a_start);
        let end = (start + short_len).min(longer_chars.len());
        let window: String = longer_chars[start..end].iter().collect();
        let r = sequence_matcher::ratio(shorter, &window);
        if r > 0.995 {
            return 1.0;
        }
        best = best.max(r);
    }
    best
}

/// Ratio of the two texts after sorting their tokens.
pub fn token_sort_ratio(
    query: &TokenizedString,
    text: &TokenizedString,
    partial: bool,
) -> f64 {
    let sorted = |s: &TokenizedString| {
        let mut tokens: Vec<&str> =
            s.words.iter().map(|w| w.text.as_str()).collect();
        tokens.sort_unstable();
        tokens.join(" ")
    };
    ratio_fn(partial)(&sorted(query), &sorted(text))
}

/// Compare the shared tokens with each side's full token set.
///
/// Builds the sorted intersection, intersection plus the query-only
/// tokens, and intersection plus the text-only tokens, then returns the
/// best pairwise ratio among the three strings. A text that is a
/// superset of the query therefore scores 1.
pub fn token_set_ratio(
    query: &TokenizedString,
    text: &TokenizedString,
    partial: bool,
) -> f64 {
    let query_set = query.token_set();
    let text_set = text.token_set();

    let join = |set: Vec<&str>| set.join(" ");
    let intersection = join(query_set.intersection(&text_set).copied().collect());
    let query_only = join(query_set.difference(&text_set).copied().collect());
    let text_only = join(text_set.difference(&query_set).copied().collect());

    let combine = |rest: &str| -> String {
        match (intersection.is_empty(), rest.is_empty()) {
            (true, _) => rest.to_string(),
            (false, true) => intersection.clone(),
            (false, false) => format!("{intersection} {rest}"),
        }
    };
    let with_query = combine(&query_only);
    let with_text = combine(&text_only);

    let f = ratio_fn(partial);
    f(&intersection, &with_query)
        .max(f(&intersection, &with_text))
        .max(f(&with_query, &with_text))
}

/// Best of the plain, token and partial ratios, picked by how much the
/// two texts differ in length.
pub fn weighted_ratio(query: &TokenizedString, text: &TokenizedString) -> f64 {
    let q = query.joined();
    let t = text.joined();
    let q_len = q.chars().count();
    let t_len = t.chars().count();
    if q_len == 0 || t_len == 0 {
        return 0.0;
    }

    let mut best = sequence_matcher::ratio(q, t);
    let length_ratio = q_len.max(t_len) as f64 / q_len.min(t_len) as f64;

    if length_ratio < PARTIAL_LENGTH_RATIO {
        best = best
            .max(token_set_ratio(query, text, false) * TOKEN_RATIO_SCALE)
            .max(token_sort_ratio(query, text, false) * TOKEN_RATIO_SCALE);
    } else {
        let partial_scale = if length_ratio < LONG_LENGTH_RATIO {
            0.9
        } else {
            0.6
        };
        best = best
            .max(partial_ratio(q, t) * partial_scale)
            .max(
                token_set_ratio(query, text, true)
                    * TOKEN_RATIO_SCALE
                    * partial_scale,
            )
            .max(
                token_sort_ratio(query, text, true)
                    * TOKEN_RATIO_SCALE
                    * partial_scale,
            );
    }

    best
}

/// Outcome of [`prefix_match`].
#[derive(Debug, Clone, PartialEq)]
pub struct PrefixMatch {
    /// `1 − 0.5^r` for the accumulated character score `r`; 0 when the
    /// query cannot be fully explained by prefixes and acronyms.
    pub score: f64,
    /// Matched byte ranges `(start, length)` in the text's original.
    pub hits: Vec<(usize, usize)>,
}

impl PrefixMatch {
    fn none() -> Self {
        Self {
            score: 0.0,
            hits: Vec::new(),
        }
    }
}

/// Match the query's characters against word prefixes of the text.
///
/// The query is consumed left to right. Each text word whose first
/// character is the next query character starts a run; the run extends
/// while characters keep matching. The very first character of the
/// text scores as a prefix hit, a run started on a later word scores as
/// a front-of-word (acronym) hit, and characters extending a run score
/// as prefix hits. Words that do not start with the next query
/// character are skipped.
pub fn prefix_match(
    query: &TokenizedString,
    text: &TokenizedString,
) -> PrefixMatch {
    let needle: Vec<char> = query
        .words
        .iter()
        .flat_map(|w| w.text.chars())
        .collect();
    if needle.is_empty() || text.is_empty() {
        return PrefixMatch::none();
    }

    let mut consumed = 0;
    let mut relevance = 0.0;
    let mut hits = Vec::new();

    for (word_idx, word) in text.words.iter().enumerate() {
        if consumed == needle.len() {
            break;
        }
        let chars: Vec<char> = word.text.chars().collect();
        if chars.first() != Some(&needle[consumed]) {
            continue;
        }

        relevance += if consumed == 0 && word_idx == 0 {
            PREFIX_CHAR_SCORE
        } else {
            FRONT_OF_WORD_SCORE
        };
        consumed += 1;
        let mut matched_bytes = chars[0].len_utf8();

        let mut k = 1;
        while k < chars.len()
            && consumed < needle.len()
            && chars[k] == needle[consumed]
        {
            relevance += PREFIX_CHAR_SCORE;
            matched_bytes += chars[k].len_utf8();
            consumed += 1;
            k += 1;
        }
        hits.push((word.start, matched_bytes.min(word.length)));
    }

    if consumed < needle.len() {
        return PrefixMatch::none();
    }

    PrefixMatch {
        score: 1.0 - 0.5f64.powf(relevance),
        hits,
    }
}

/// Combined relevance in `[0, 1]`.
///
/// Identical normalized texts score 1. Otherwise the prefix score and
/// the weighted ratio are combined as independent evidence:
/// `1 − (1 − prefix)(1 − weighted)`.
pub fn relevance(query: &TokenizedString, text: &TokenizedString) -> f64 {
    scored_match(query, text).0
}

/// Relevance plus the hit ranges that produced it.
pub fn scored_match(
    query: &TokenizedString,
    text: &TokenizedString,
) -> (f64, Vec<(usize, usize)>) {
    if query.is_empty() || text.is_empty() {
        return (0.0, Vec::new());
    }
    if query.joined() == text.joined() {
        return (1.0, vec![(0, text.original.len())]);
    }

    let prefix = prefix_match(query, text);
    let weighted = weighted_ratio(query, text);
    let score = 1.0 - (1.0 - prefix.score) * (1.0 - weighted);
    (score.clamp(0.0, 1.0), prefix.hits)
}

pub fn is_relevant(
    query: &TokenizedString,
    text: &TokenizedString,
    threshold: f64,
) -> bool {
    relevance(query, text) >= threshold
}

/// Two-stage approximate test used to match query terms against index
/// terms: a cheap prefix test, then a block-match ratio test.
pub fn is_relevant_approximately(
    query: &TokenizedString,
    text: &TokenizedString,
    prefix_threshold: f64,
    block_threshold: f64,
) -> bool {
    if query.is_empty() || text.is_empty() {
        return false;
    }
    if prefix_match(query, text).score >= prefix_threshold {
        return true;
    }
    sequence_matcher::ratio(query.joined(), text.joined()) >= block_threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> TokenizedString {
        TokenizedString::new(s)
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn partial_ratio_finds_embedded_string() {
        assert_eq!(partial_ratio("york", "new york city"), 1.0);
        assert!(close(partial_ratio("cc", "clash of clan"), 0.5));
        assert_eq!(partial_ratio("", "abc"), 0.0);
    }

    #[test]
    fn token_sort_ignores_word_order() {
        assert_eq!(token_sort_ratio(&ts("world hello"), &ts("Hello World"), false), 1.0);
    }

    #[test]
    fn token_set_favors_supersets() {
        let q = ts("golden retriever");
        let superset = ts("a golden retriever puppy");
        let overlap = ts("golden gate bridge");
        let superset_score = token_set_ratio(&q, &superset, false);
        let overlap_score = token_set_ratio(&q, &overlap, false);
        assert_eq!(superset_score, 1.0);
        assert!(overlap_score < superset_score);
    }

    #[test]
    fn token_set_single_words() {
        assert_eq!(token_set_ratio(&ts("dog"), &ts("dog"), false), 1.0);
        assert!(close(token_set_ratio(&ts("dog"), &ts("dogs"), false), 6.0 / 7.0));
        assert!(close(
            token_set_ratio(&ts("cat"), &ts("category"), false),
            6.0 / 11.0
        ));
    }

    #[test]
    fn weighted_ratio_uses_partials_for_long_texts() {
        let score = weighted_ratio(&ts("cc"), &ts("Clash Of Clan"));
        assert!(close(score, 0.45), "score = {score}");
    }

    #[test]
    fn prefix_match_scores_prefix_and_acronym() {
        let m = prefix_match(&ts("cc"), &ts("Clash Of Clan"));
        assert!(close(m.score, 1.0 - 0.5f64.powf(1.8)));
        assert_eq!(m.hits, vec![(0, 1), (9, 1)]);

        let m = prefix_match(&ts("prog"), &ts("programming"));
        assert!(close(m.score, 1.0 - 0.5f64.powf(4.0)));
        assert_eq!(m.hits, vec![(0, 4)]);
    }

    #[test]
    fn prefix_match_requires_whole_query() {
        assert_eq!(prefix_match(&ts("cx"), &ts("Clash Of Clan")).score, 0.0);
        assert_eq!(prefix_match(&ts("cc"), &ts("famous")).score, 0.0);
    }

    #[test]
    fn relevance_blends_prefix_and_ratio() {
        let clash = relevance(&ts("CC"), &ts("Clash Of Clan"));
        assert!(clash > 0.8 && clash < 0.9, "clash = {clash}");
        assert_eq!(relevance(&ts("CC"), &ts("famous")), 0.0);
        assert_eq!(relevance(&ts("Hello-World"), &ts("hello world")), 1.0);
        assert_eq!(relevance(&ts(""), &ts("anything")), 0.0);
    }

    #[test]
    fn prefix_beats_scattered_overlap() {
        let query = ts("set");
        let prefix_hit = relevance(&query, &ts("Settings"));
        let scattered = relevance(&query, &ts("reset timer"));
        assert!(prefix_hit > scattered);
    }

    #[test]
    fn approximate_relevance_tolerates_typos() {
        assert!(is_relevant_approximately(&ts("prog"), &ts("programming"), 0.6, 0.6));
        assert!(is_relevant_approximately(&ts("rsut"), &ts("rust"), 0.6, 0.6));
        assert!(!is_relevant_approximately(&ts("dog"), &ts("rust"), 0.6, 0.6));
        assert!(!is_relevant_approximately(&ts("p"), &ts("programming"), 0.6, 0.6));
    }
}
