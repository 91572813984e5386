use std::collections::HashMap;

use crate::types::{Document, Position, Token, WeightedPosition};

/// Words that carry no search signal and are never indexed.
const STOP_WORDS: &[&str] = &[
    "a", "about", "an", "and", "are", "as", "at", "be", "but", "by", "for",
    "from", "has", "have", "he", "her", "his", "i", "in", "into", "is", "it",
    "its", "of", "on", "or", "our", "she", "that", "the", "their", "them",
    "these", "they", "this", "those", "to", "was", "we", "were", "what",
    "which", "who", "will", "with", "you", "your",
];

pub fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.contains(&word)
}

/// A normalized word and the byte range it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Word {
    pub text: String,
    pub start: usize,
    pub length: usize,
}

/// Split text into lowercase words.
///
/// Any non-alphanumeric character separates words, and camel-case
/// boundaries split a word further: `fooBar` yields `foo` and `bar`,
/// `HTMLParser` yields `html` and `parser`.
pub fn tokenize(text: &str) -> Vec<String> {
    split_words(text).into_iter().map(|w| w.text).collect()
}

/// Like [`tokenize`], keeping the byte range of every word.
pub fn split_words(text: &str) -> Vec<Word> {
    let mut words = Vec::new();
    let mut run: Vec<(usize, char)> = Vec::new();

    for (idx, ch) in text.char_indices() {
        if ch.is_alphanumeric() {
            run.push((idx, ch));
        } else if !run.is_empty() {
            split_camel_case(&run, idx, &mut words);
            run.clear();
        }
    }
    if !run.is_empty() {
        split_camel_case(&run, text.len(), &mut words);
    }

    words
}

fn split_camel_case(run: &[(usize, char)], end: usize, out: &mut Vec<Word>) {
    let mut piece_start = 0;
    for i in 1..run.len() {
        let prev = run[i - 1].1;
        let cur = run[i].1;
        let next = run.get(i + 1).map(|&(_, c)| c);

        let lower_to_upper =
            (prev.is_lowercase() || prev.is_numeric()) && cur.is_uppercase();
        let acronym_end = prev.is_uppercase()
            && cur.is_uppercase()
            && next.is_some_and(char::is_lowercase);

        if lower_to_upper || acronym_end {
            out.push(make_word(run, piece_start, i, run[i].0));
            piece_start = i;
        }
    }
    out.push(make_word(run, piece_start, run.len(), end));
}

fn make_word(
    run: &[(usize, char)],
    from: usize,
    to: usize,
    end_byte: usize,
) -> Word {
    let start = run[from].0;
    let text: String = run[from..to]
        .iter()
        .flat_map(|&(_, c)| c.to_lowercase())
        .collect();
    Word {
        text,
        start,
        length: end_byte - start,
    }
}

/// Turn one content field into index tokens.
///
/// Stop words are dropped and repeated words collapse into a single
/// token carrying every position, each weighted with `weight`.
pub fn extract_content(content_id: &str, text: &str, weight: f64) -> Vec<Token> {
    let mut tokens: Vec<Token> = Vec::new();
    let mut slots: HashMap<String, usize> = HashMap::new();

    for word in split_words(text) {
        if is_stop_word(&word.text) {
            continue;
        }
        let position = WeightedPosition {
            weight,
            position: Position {
                content_id: content_id.to_string(),
                start: word.start,
                length: word.length,
            },
        };
        match slots.get(&word.text) {
            Some(&slot) => tokens[slot].positions.push(position),
            None => {
                slots.insert(word.text.clone(), tokens.len());
                tokens.push(Token {
                    content: word.text,
                    positions: vec![position],
                });
            }
        }
    }

    tokens
}

/// Tokens of every content of a document, merged by term.
pub fn extract_document_tokens(document: &Document) -> Vec<Token> {
    let mut tokens: Vec<Token> = Vec::new();
    let mut slots: HashMap<String, usize> = HashMap::new();

    for content in &document.contents {
        for token in extract_content(&content.id, &content.text, content.weight)
        {
            match slots.get(&token.content) {
                Some(&slot) => tokens[slot].positions.extend(token.positions),
                None => {
                    slots.insert(token.content.clone(), tokens.len());
                    tokens.push(token);
                }
            }
        }
    }

    tokens
}
