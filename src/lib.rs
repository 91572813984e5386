//! localdex - local, on-device content search.
//!
//! Two layers share the same tokenizer and fuzzy matcher:
//!
//! - In-memory document indexes behind the [`index::Index`] trait: a
//!   brute-force fuzzy [`LinearIndex`] and a TF-IDF ranked
//!   [`InvertedIndexSearch`].
//! - A SQLite [`AnnotationStore`] mapping image files to the words and
//!   labels found in them, kept current by the [`IngestionWorker`].
//!
//! # Quick start
//!
//! ```no_run
//! use localdex::{AnnotationStore, DataDir};
//!
//! let data_dir = DataDir::resolve(None).unwrap();
//! let store = AnnotationStore::open(&data_dir.annotations_db()).unwrap();
//!
//! for hit in store.search("golden retriever beach", 10).unwrap() {
//!     println!("{} ({:.3})", hit.path.display(), hit.relevance);
//! }
//! ```
//!
//! ```
//! use localdex::{BackendKind, Content, Document, SearchParams, create_index};
//!
//! let mut index = create_index(BackendKind::Linear, SearchParams::default());
//! index.add_or_update(vec![Document::new(
//!     "game",
//!     vec![Content::new("title", "Clash Of Clan", 1.0)],
//! )]);
//! let hits = index.find("CC", 0).unwrap();
//! assert_eq!(hits[0].id, "game");
//! ```

pub mod annotation_store;
pub mod annotator;
pub mod cli;
pub mod config;
pub mod data_dir;
pub mod error;
pub mod fuzzy;
pub mod incremental;
pub mod index;
pub mod ingestion;
pub mod inverted_index;
pub mod inverted_search;
pub mod linear_index;
pub mod search;
pub mod sequence_matcher;
pub mod tokenizer;
pub mod types;
pub mod walker;
pub mod worker;

pub use annotation_store::{AnnotationStore, FileSearchResult, ImageInfo};
pub use config::IngestConfig;
pub use data_dir::DataDir;
pub use error::{Error, Result};
pub use index::{BackendKind, FindError, Index, SearchService, create_index};
pub use inverted_search::InvertedIndexSearch;
pub use linear_index::LinearIndex;
pub use types::{Content, Document, SearchParams, SearchResult};
pub use worker::{IngestHandle, IngestStats, IngestionWorker, WorkerState};
