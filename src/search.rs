use std::path::Path;

use serde::Serialize;

use crate::{
    annotation_store::{AnnotationStore, FileSearchResult, ImageInfo},
    cli::{FindArgs, SearchArgs},
    error::Result,
    index::{BackendKind, IndexId, SearchService},
    ingestion,
    types::{SearchParams, SearchResult},
    walker::{self, FileFilter},
};

/// Extensions the `find` command indexes.
const TEXT_EXTENSIONS: &[&str] = &["md", "txt"];

/// Run an annotation search against the store.
pub fn execute_search(
    args: &SearchArgs,
    store: &AnnotationStore,
) -> Result<Vec<FileSearchResult>> {
    store.search(&args.query, args.count)
}

/// Index the text files under `args.dir` in memory and query them.
///
/// An index with no documents yields no results rather than an error;
/// an empty query is still reported.
pub fn execute_find(args: &FindArgs) -> Result<Vec<SearchResult>> {
    let filter = FileFilter::new(TEXT_EXTENSIONS, Vec::new());
    let files = walker::discover_files(&args.dir, &filter)?;
    let documents = ingestion::load_text_documents(&files);

    let mut params = SearchParams::default();
    if let Some(min_score) = args.min_score {
        params.relevance_threshold = min_score;
    }
    let mut service = SearchService::new(params);
    let index = service.get_or_create(
        IndexId(args.dir.to_string_lossy().to_string()),
        BackendKind::from(args.backend),
    )?;
    index.add_or_update(documents);

    match index.find(&args.query, args.count) {
        Err(crate::index::FindError::EmptyIndex) => Ok(Vec::new()),
        other => Ok(other?),
    }
}

/// Format results for human-readable terminal output.
pub fn format_human(results: &[FileSearchResult]) {
    if results.is_empty() {
        println!("No results found.");
        return;
    }

    for (rank, r) in results.iter().enumerate() {
        println!("{:>3}. [{:.3}] {}", rank + 1, r.relevance, r.path.display());
    }
    println!("\n{} result(s)", results.len());
}

#[derive(Serialize)]
struct JsonResults<'a, T> {
    query: &'a str,
    result_count: usize,
    results: &'a [T],
}

/// Format results as JSON output.
pub fn format_json<T: Serialize>(results: &[T], query: &str) -> Result<()> {
    let out = JsonResults {
        query,
        result_count: results.len(),
        results,
    };
    println!("{}", serde_json::to_string(&out)?);
    Ok(())
}

/// Format results as plain file paths (one per line).
pub fn format_files(results: &[FileSearchResult]) {
    for r in results {
        println!("{}", r.path.display());
    }
}

/// Format in-memory `find` hits, with the matched snippets.
pub fn format_find_human(results: &[SearchResult], root: &Path) {
    if results.is_empty() {
        println!("No results found.");
        return;
    }

    for (rank, r) in results.iter().enumerate() {
        println!(
            "{:>3}. [{:.3}] {}",
            rank + 1,
            r.score,
            root.join(&r.id).display()
        );
        let fields: Vec<&str> = r
            .positions
            .iter()
            .map(|p| p.position.content_id.as_str())
            .collect();
        if !fields.is_empty() {
            println!("     matched in: {}", dedup_sorted(fields).join(", "));
        }
    }
    println!("\n{} result(s)", results.len());
}

fn dedup_sorted(mut items: Vec<&str>) -> Vec<&str> {
    items.sort_unstable();
    items.dedup();
    items
}

/// Print stored annotations, one file per block.
pub fn format_infos(infos: &[ImageInfo]) {
    for info in infos {
        println!("{}", info.path.display());
        let terms: Vec<&str> =
            info.annotations.iter().map(String::as_str).collect();
        println!("     {}", terms.join(", "));
    }
}
