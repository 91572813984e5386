//! SQLite-backed inverted index from file paths to annotation terms.
//!
//! Layout:
//!
//! - `documents(document_id, file_path UNIQUE, last_modified_time, file_type)`
//! - `terms(term_id, text UNIQUE)`
//! - `inverted_index(term_id, document_id)`, one row per pair
//! - `meta(key, value)`: schema version and persisted settings
//!
//! A term without any `inverted_index` row never survives a write.
//! Opening a database written with another schema version drops the
//! three index tables; the ingestion worker repopulates them.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::{Path, PathBuf},
};

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    error::Result,
    fuzzy::{self, TokenizedString},
    tokenizer,
};

pub const SCHEMA_VERSION: i64 = 2;

const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Minimum token-set ratio between a query word and a stored term.
pub const DEFAULT_RELEVANCE_THRESHOLD: f64 = 0.79;

const CREATE_TABLES: &str = "
    CREATE TABLE IF NOT EXISTS documents (
        document_id INTEGER PRIMARY KEY AUTOINCREMENT,
        file_path TEXT NOT NULL UNIQUE,
        last_modified_time INTEGER NOT NULL,
        file_type TEXT
    );
    CREATE TABLE IF NOT EXISTS terms (
        term_id INTEGER PRIMARY KEY AUTOINCREMENT,
        text TEXT NOT NULL UNIQUE
    );
    CREATE TABLE IF NOT EXISTS inverted_index (
        term_id INTEGER NOT NULL REFERENCES terms(term_id),
        document_id INTEGER NOT NULL REFERENCES documents(document_id),
        PRIMARY KEY (term_id, document_id)
    );
    CREATE INDEX IF NOT EXISTS inverted_index_by_document
        ON inverted_index(document_id);
";

const DROP_TABLES: &str = "
    DROP INDEX IF EXISTS inverted_index_by_document;
    DROP TABLE IF EXISTS inverted_index;
    DROP TABLE IF EXISTS terms;
    DROP TABLE IF EXISTS documents;
";

/// Annotations of one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    pub path: PathBuf,
    /// Modification time, nanoseconds since the Unix epoch.
    pub last_modified: i64,
    pub annotations: BTreeSet<String>,
}

impl ImageInfo {
    pub fn new<I, S>(
        path: impl Into<PathBuf>,
        last_modified: i64,
        annotations: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            path: path.into(),
            last_modified,
            annotations: annotations.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileSearchResult {
    pub path: PathBuf,
    pub last_modified: i64,
    pub relevance: f64,
}

pub struct AnnotationStore {
    conn: Connection,
    relevance_threshold: f64,
}

impl AnnotationStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;",
        )?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL
            );",
        )?;

        let stored: Option<i64> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                [SCHEMA_VERSION_KEY],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .and_then(|v| v.parse().ok());

        if stored != Some(SCHEMA_VERSION) {
            if let Some(old) = stored {
                warn!(
                    old,
                    new = SCHEMA_VERSION,
                    "annotation schema changed, dropping stored annotations"
                );
            }
            conn.execute_batch(DROP_TABLES)?;
            conn.execute(
                "INSERT INTO meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![SCHEMA_VERSION_KEY, SCHEMA_VERSION.to_string()],
            )?;
        }
        conn.execute_batch(CREATE_TABLES)?;

        Ok(Self {
            conn,
            relevance_threshold: DEFAULT_RELEVANCE_THRESHOLD,
        })
    }

    pub fn with_relevance_threshold(mut self, threshold: f64) -> Self {
        self.relevance_threshold = threshold;
        self
    }

    pub fn relevance_threshold(&self) -> f64 {
        self.relevance_threshold
    }

    // -- Writes --

    /// Record a file and link it to each of its annotation terms.
    ///
    /// Runs in one transaction: on error nothing of this call is kept.
    /// An existing row for the same path gets the new modification time
    /// and keeps its previous terms, so callers replacing annotations
    /// should [`remove`](Self::remove) first.
    pub fn insert(&mut self, info: &ImageInfo) -> Result<()> {
        let path = info.path.to_string_lossy();
        let file_type = info
            .path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase());

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO documents (file_path, last_modified_time, file_type)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(file_path) DO UPDATE SET
                 last_modified_time = excluded.last_modified_time,
                 file_type = excluded.file_type",
            params![path, info.last_modified, file_type],
        )?;
        let document_id: i64 = tx.query_row(
            "SELECT document_id FROM documents WHERE file_path = ?1",
            [&path],
            |row| row.get(0),
        )?;

        for annotation in &info.annotations {
            let term = annotation.trim().to_lowercase();
            if term.is_empty() {
                continue;
            }
            tx.execute("INSERT OR IGNORE INTO terms (text) VALUES (?1)", [
                &term,
            ])?;
            let term_id: i64 = tx.query_row(
                "SELECT term_id FROM terms WHERE text = ?1",
                [&term],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO inverted_index (term_id, document_id)
                 VALUES (?1, ?2)",
                params![term_id, document_id],
            )?;
        }

        tx.commit()?;
        debug!(
            path = %path,
            terms = info.annotations.len(),
            "stored annotations"
        );
        Ok(())
    }

    /// Forget a file and prune terms no other file uses.
    ///
    /// Returns whether the file was stored.
    pub fn remove(&mut self, path: &Path) -> Result<bool> {
        let path = path.to_string_lossy();
        let tx = self.conn.transaction()?;

        let document_id: Option<i64> = tx
            .query_row(
                "SELECT document_id FROM documents WHERE file_path = ?1",
                [&path],
                |row| row.get(0),
            )
            .optional()?;
        let Some(document_id) = document_id else {
            return Ok(false);
        };

        tx.execute("DELETE FROM inverted_index WHERE document_id = ?1", [
            document_id,
        ])?;
        tx.execute("DELETE FROM documents WHERE document_id = ?1", [
            document_id,
        ])?;
        let pruned = tx.execute(
            "DELETE FROM terms WHERE NOT EXISTS (
                 SELECT 1 FROM inverted_index ii
                 WHERE ii.term_id = terms.term_id
             )",
            [],
        )?;
        tx.commit()?;

        debug!(path = %path, pruned_terms = pruned, "removed annotations");
        Ok(true)
    }

    // -- Reads --

    /// Annotations stored for exactly `path`.
    pub fn find_by_path(&self, path: &Path) -> Result<Vec<ImageInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT t.text, d.file_path, d.last_modified_time
             FROM documents d
             JOIN inverted_index ii ON ii.document_id = d.document_id
             JOIN terms t ON t.term_id = ii.term_id
             WHERE d.file_path = ?1
             ORDER BY t.text, d.file_path",
        )?;
        let rows = stmt
            .query_map([path.to_string_lossy()], annotation_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(group_by_path(rows))
    }

    /// Every annotated file, ordered by path.
    pub fn get_all(&self) -> Result<Vec<ImageInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT t.text, d.file_path, d.last_modified_time
             FROM documents d
             JOIN inverted_index ii ON ii.document_id = d.document_id
             JOIN terms t ON t.term_id = ii.term_id
             ORDER BY t.text, d.file_path",
        )?;
        let rows = stmt
            .query_map([], annotation_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(group_by_path(rows))
    }

    /// Stored modification time of `path`, annotated or not.
    pub fn last_modified(&self, path: &Path) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT last_modified_time FROM documents WHERE file_path = ?1",
                [path.to_string_lossy()],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Every stored file path, annotated or not.
    pub fn all_paths(&self) -> Result<Vec<PathBuf>> {
        let mut stmt = self
            .conn
            .prepare("SELECT file_path FROM documents ORDER BY file_path")?;
        let paths = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .map(|r| r.map(PathBuf::from))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(paths)
    }

    /// Stored modification time of every file.
    pub fn modification_times(&self) -> Result<HashMap<PathBuf, i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT file_path, last_modified_time FROM documents")?;
        let times = stmt
            .query_map([], |row| {
                Ok((PathBuf::from(row.get::<_, String>(0)?), row.get(1)?))
            })?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        Ok(times)
    }

    pub fn document_count(&self) -> Result<usize> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM documents", [], |row| {
                    row.get(0)
                })?;
        Ok(count as usize)
    }

    pub fn term_count(&self) -> Result<usize> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM terms", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // -- Search --

    /// Files with a term starting with `term`, scored fuzzily.
    ///
    /// `LIKE` narrows the candidates, then each matched term is scored
    /// against `term` with a token-set ratio; candidates under the
    /// relevance threshold are dropped. A file matched through several
    /// terms keeps its best score.
    pub fn prefix_search(&self, term: &str) -> Result<Vec<FileSearchResult>> {
        let term = term.trim().to_lowercase();
        if term.is_empty() {
            return Ok(Vec::new());
        }

        let mut stmt = self.conn.prepare(
            "SELECT t.text, d.file_path, d.last_modified_time
             FROM terms t
             JOIN inverted_index ii ON ii.term_id = t.term_id
             JOIN documents d ON d.document_id = ii.document_id
             WHERE t.text LIKE ?1 ESCAPE '\\'",
        )?;
        let rows = stmt
            .query_map([format!("{}%", escape_like(&term))], annotation_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let query = TokenizedString::new(&term);
        let mut best: HashMap<String, FileSearchResult> = HashMap::new();
        for (text, path, last_modified) in rows {
            let relevance = fuzzy::token_set_ratio(
                &query,
                &TokenizedString::new(&text),
                false,
            );
            if relevance < self.relevance_threshold {
                continue;
            }
            best.entry(path)
                .and_modify(|hit| hit.relevance = hit.relevance.max(relevance))
                .or_insert_with_key(|path| FileSearchResult {
                    path: PathBuf::from(path),
                    last_modified,
                    relevance,
                });
        }

        let mut results: Vec<_> = best.into_values().collect();
        results.sort_by(by_relevance);
        Ok(results)
    }

    /// Files matching every non-stop-word of `query`.
    ///
    /// Each word runs a [`prefix_search`](Self::prefix_search); the
    /// per-word result sets are intersected by path and their scores
    /// summed. A word without matches empties the whole result. Scores
    /// are divided by the number of words, so they stay in `[0, 1]`.
    pub fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<FileSearchResult>> {
        if max_results < 1 {
            return Ok(Vec::new());
        }
        let words: Vec<String> = tokenizer::tokenize(query)
            .into_iter()
            .filter(|word| !tokenizer::is_stop_word(word))
            .collect();
        if words.is_empty() {
            return Ok(Vec::new());
        }

        let mut running: Option<HashMap<PathBuf, FileSearchResult>> = None;
        for word in &words {
            let matches = self.prefix_search(word)?;
            if matches.is_empty() {
                return Ok(Vec::new());
            }

            let merged = match running.take() {
                None => matches
                    .into_iter()
                    .map(|m| (m.path.clone(), m))
                    .collect(),
                Some(mut acc) => {
                    let scores: HashMap<PathBuf, f64> = matches
                        .into_iter()
                        .map(|m| (m.path, m.relevance))
                        .collect();
                    acc.retain(|path, hit| match scores.get(path) {
                        Some(relevance) => {
                            hit.relevance += relevance;
                            true
                        }
                        None => false,
                    });
                    acc
                }
            };
            if merged.is_empty() {
                return Ok(Vec::new());
            }
            running = Some(merged);
        }

        let mut results: Vec<FileSearchResult> =
            running.unwrap_or_default().into_values().collect();
        if results.len() > max_results {
            results.select_nth_unstable_by(max_results - 1, by_relevance);
            results.truncate(max_results);
        }
        results.sort_by(by_relevance);

        let word_count = words.len() as f64;
        for hit in &mut results {
            hit.relevance /= word_count;
        }
        Ok(results)
    }

    // -- Settings --

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row("SELECT value FROM meta WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn remove_setting(&self, key: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM meta WHERE key = ?1", [key])?;
        Ok(removed > 0)
    }

    /// Persisted settings, excluding internal bookkeeping keys.
    pub fn list_settings(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT key, value FROM meta WHERE key != ?1 ORDER BY key",
        )?;
        let settings = stmt
            .query_map([SCHEMA_VERSION_KEY], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(settings)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl std::fmt::Debug for AnnotationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnnotationStore")
            .field("relevance_threshold", &self.relevance_threshold)
            .finish_non_exhaustive()
    }
}

fn annotation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn group_by_path(rows: Vec<(String, String, i64)>) -> Vec<ImageInfo> {
    let mut by_path: BTreeMap<String, ImageInfo> = BTreeMap::new();
    for (term, path, last_modified) in rows {
        by_path
            .entry(path)
            .or_insert_with_key(|path| ImageInfo {
                path: PathBuf::from(path),
                last_modified,
                annotations: BTreeSet::new(),
            })
            .annotations
            .insert(term);
    }
    by_path.into_values().collect()
}

fn by_relevance(a: &FileSearchResult, b: &FileSearchResult) -> std::cmp::Ordering {
    b.relevance
        .total_cmp(&a.relevance)
        .then_with(|| a.path.cmp(&b.path))
}

/// Escape `LIKE` wildcards so `term` matches literally.
fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
