//! Ingestion and search configuration.
//!
//! Values are layered: built-in defaults, then settings persisted in
//! the annotation store's `meta` table (`localdex config set`), then
//! command line flags applied by the binary.

use std::{path::PathBuf, time::Duration};

use crate::{
    annotation_store::{AnnotationStore, DEFAULT_RELEVANCE_THRESHOLD},
    error::{Error, Result},
    walker::FileFilter,
};

pub const DEFAULT_EXTENSIONS: &[&str] =
    &["png", "jpg", "jpeg", "webp", "gif", "bmp"];
pub const DEFAULT_MAX_FILE_SIZE: u64 = 20 * 1024 * 1024;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_LABEL_THRESHOLD: f32 = 0.5;
pub const DEFAULT_MIN_TERM_LENGTH: usize = 4;

pub const KEY_EXTENSIONS: &str = "ingest.extensions";
pub const KEY_EXCLUDE: &str = "ingest.exclude";
pub const KEY_MAX_FILE_SIZE: &str = "ingest.max_file_size";
pub const KEY_POLL_INTERVAL_MS: &str = "ingest.poll_interval_ms";
pub const KEY_LABEL_THRESHOLD: &str = "ingest.label_threshold";
pub const KEY_MIN_TERM_LENGTH: &str = "ingest.min_term_length";
pub const KEY_OCR_COMMAND: &str = "annotator.ocr_command";
pub const KEY_LABEL_COMMAND: &str = "annotator.label_command";
pub const KEY_RELEVANCE_THRESHOLD: &str = "search.relevance_threshold";

/// Every key `config set` accepts.
pub const SETTING_KEYS: &[&str] = &[
    KEY_EXTENSIONS,
    KEY_EXCLUDE,
    KEY_MAX_FILE_SIZE,
    KEY_POLL_INTERVAL_MS,
    KEY_LABEL_THRESHOLD,
    KEY_MIN_TERM_LENGTH,
    KEY_OCR_COMMAND,
    KEY_LABEL_COMMAND,
    KEY_RELEVANCE_THRESHOLD,
];

#[derive(Debug, Clone, PartialEq)]
pub struct IngestConfig {
    /// Lowercase file extensions eligible for ingestion.
    pub extensions: Vec<String>,
    /// Path prefixes never ingested.
    pub exclude: Vec<PathBuf>,
    /// Files larger than this are treated as deleted.
    pub max_file_size: u64,
    /// Delay between annotator readiness checks.
    pub poll_interval: Duration,
    /// Minimum confidence for a content label to become a term.
    pub label_threshold: f32,
    /// Terms shorter than this are dropped.
    pub min_term_length: usize,
    /// Keep watching the roots after the startup scan.
    pub watch: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            extensions: DEFAULT_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            exclude: Vec::new(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
            label_threshold: DEFAULT_LABEL_THRESHOLD,
            min_term_length: DEFAULT_MIN_TERM_LENGTH,
            watch: true,
        }
    }
}

impl IngestConfig {
    /// Defaults overridden by the settings persisted in `store`.
    pub fn load(store: &AnnotationStore) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = store.get_setting(KEY_EXTENSIONS)? {
            config.extensions = parse_list(&v);
        }
        if let Some(v) = store.get_setting(KEY_EXCLUDE)? {
            config.exclude = parse_list(&v).into_iter().map(PathBuf::from).collect();
        }
        if let Some(v) = store.get_setting(KEY_MAX_FILE_SIZE)? {
            config.max_file_size = parse_number(KEY_MAX_FILE_SIZE, &v)?;
        }
        if let Some(v) = store.get_setting(KEY_POLL_INTERVAL_MS)? {
            config.poll_interval =
                Duration::from_millis(parse_number(KEY_POLL_INTERVAL_MS, &v)?);
        }
        if let Some(v) = store.get_setting(KEY_LABEL_THRESHOLD)? {
            config.label_threshold = parse_unit(KEY_LABEL_THRESHOLD, &v)? as f32;
        }
        if let Some(v) = store.get_setting(KEY_MIN_TERM_LENGTH)? {
            config.min_term_length = parse_number(KEY_MIN_TERM_LENGTH, &v)?;
        }
        Ok(config)
    }

    pub fn file_filter(&self) -> FileFilter {
        FileFilter::new(&self.extensions, self.exclude.clone())
    }
}

/// Relevance threshold for annotation search, persisted or default.
pub fn relevance_threshold(store: &AnnotationStore) -> Result<f64> {
    match store.get_setting(KEY_RELEVANCE_THRESHOLD)? {
        Some(v) => parse_unit(KEY_RELEVANCE_THRESHOLD, &v),
        None => Ok(DEFAULT_RELEVANCE_THRESHOLD),
    }
}

/// Check that `value` is acceptable for `key` before persisting it.
pub fn validate_setting(key: &str, value: &str) -> Result<()> {
    match key {
        KEY_EXTENSIONS | KEY_EXCLUDE | KEY_OCR_COMMAND | KEY_LABEL_COMMAND => {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{key} must not be empty")));
            }
            Ok(())
        }
        KEY_MAX_FILE_SIZE => parse_number::<u64>(key, value).map(|_| ()),
        KEY_POLL_INTERVAL_MS => match parse_number::<u64>(key, value)? {
            0 => Err(Error::Config(format!("{key} must be positive"))),
            _ => Ok(()),
        },
        KEY_MIN_TERM_LENGTH => parse_number::<usize>(key, value).map(|_| ()),
        KEY_LABEL_THRESHOLD | KEY_RELEVANCE_THRESHOLD => {
            parse_unit(key, value).map(|_| ())
        }
        other => Err(Error::Config(format!(
            "unknown setting '{other}' (known: {})",
            SETTING_KEYS.join(", ")
        ))),
    }
}

/// Split a comma separated setting into trimmed, non-empty items.
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        Error::Config(format!("{key} expects a non-negative integer, got '{value}'"))
    })
}

fn parse_unit(key: &str, value: &str) -> Result<f64> {
    match value.trim().parse::<f64>() {
        Ok(v) if (0.0..=1.0).contains(&v) => Ok(v),
        _ => Err(Error::Config(format!(
            "{key} expects a number between 0 and 1, got '{value}'"
        ))),
    }
}
