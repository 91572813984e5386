//! Longest-matching-block string similarity.
//!
//! Two strings are compared by repeatedly taking their longest common
//! substring and recursing on the pieces to its left and right. The
//! total number of matched characters `M` gives the similarity ratio
//! `2·M / (|a| + |b|)`.

use std::collections::HashMap;

/// A run of `length` equal characters at `a[a_start..]` and `b[b_start..]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchingBlock {
    pub a_start: usize,
    pub b_start: usize,
    pub length: usize,
}

#[derive(Debug)]
pub struct SequenceMatcher {
    a: Vec<char>,
    b: Vec<char>,
    b_index: HashMap<char, Vec<usize>>,
}

impl SequenceMatcher {
    pub fn new(a: &str, b: &str) -> Self {
        let a: Vec<char> = a.chars().collect();
        let b: Vec<char> = b.chars().collect();
        let mut b_index: HashMap<char, Vec<usize>> = HashMap::new();
        for (j, &c) in b.iter().enumerate() {
            b_index.entry(c).or_default().push(j);
        }
        Self { a, b, b_index }
    }

    fn longest_match(
        &self,
        a_lo: usize,
        a_hi: usize,
        b_lo: usize,
        b_hi: usize,
    ) -> MatchingBlock {
        let mut best = MatchingBlock {
            a_start: a_lo,
            b_start: b_lo,
            length: 0,
        };
        // Length of the match ending at b[j] for the previous row of `a`.
        let mut run_len: HashMap<usize, usize> = HashMap::new();

        for i in a_lo..a_hi {
            let mut next_run_len = HashMap::new();
            if let Some(positions) = self.b_index.get(&self.a[i]) {
                for &j in positions {
                    if j < b_lo {
                        continue;
                    }
                    if j >= b_hi {
                        break;
                    }
                    let prev = if j > 0 {
                        run_len.get(&(j - 1)).copied().unwrap_or(0)
                    } else {
                        0
                    };
                    let k = prev + 1;
                    next_run_len.insert(j, k);
                    if k > best.length {
                        best = MatchingBlock {
                            a_start: i + 1 - k,
                            b_start: j + 1 - k,
                            length: k,
                        };
                    }
                }
            }
            run_len = next_run_len;
        }

        best
    }

    /// Non-overlapping matching blocks, ordered by position in `a`.
    pub fn matching_blocks(&self) -> Vec<MatchingBlock> {
        let mut blocks = Vec::new();
        let mut pending = vec![(0, self.a.len(), 0, self.b.len())];

        while let Some((a_lo, a_hi, b_lo, b_hi)) = pending.pop() {
            let block = self.longest_match(a_lo, a_hi, b_lo, b_hi);
            if block.length == 0 {
                continue;
            }
            if a_lo < block.a_start && b_lo < block.b_start {
                pending.push((a_lo, block.a_start, b_lo, block.b_start));
            }
            let a_end = block.a_start + block.length;
            let b_end = block.b_start + block.length;
            if a_end < a_hi && b_end < b_hi {
                pending.push((a_end, a_hi, b_end, b_hi));
            }
            blocks.push(block);
        }

        blocks.sort_by_key(|b| (b.a_start, b.b_start));
        blocks
    }

    /// Similarity in `[0, 1]`. Two empty strings score 0.
    pub fn ratio(&self) -> f64 {
        let total = self.a.len() + self.b.len();
        if total == 0 {
            return 0.0;
        }
        let matched: usize =
            self.matching_blocks().iter().map(|b| b.length).sum();
        2.0 * matched as f64 / total as f64
    }
}

pub fn ratio(a: &str, b: &str) -> f64 {
    SequenceMatcher::new(a, b).ratio()
}
