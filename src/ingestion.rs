//! Individual steps of the ingestion pipeline.
//!
//! The worker sequences these; each one is a plain function so the
//! blocking ones can run on the blocking pool and all of them can be
//! tested without a runtime.

use std::{
    collections::BTreeSet,
    io::Read,
    path::Path,
};

use rayon::prelude::*;

use crate::{
    annotator::{Annotation, AnnotatorKind},
    config::IngestConfig,
    error::Result,
    incremental::file_mtime,
    tokenizer,
    types::{Content, Document},
    walker::DiscoveredFile,
};

/// Outcome of stat-ing a queued path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileProbe {
    /// Missing, or not a regular file.
    Gone,
    Empty,
    TooLarge(u64),
    Present { mtime: i64, size: u64 },
}

pub fn probe(path: &Path, max_size: u64) -> FileProbe {
    let Ok(meta) = std::fs::metadata(path) else {
        return FileProbe::Gone;
    };
    if !meta.is_file() {
        return FileProbe::Gone;
    }
    match meta.len() {
        0 => FileProbe::Empty,
        size if size > max_size => FileProbe::TooLarge(size),
        size => FileProbe::Present {
            mtime: file_mtime(&meta),
            size,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    Webp,
    Bmp,
}

/// Identify an image by its leading magic bytes.
pub fn sniff_format(header: &[u8]) -> Option<ImageFormat> {
    if header.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some(ImageFormat::Png)
    } else if header.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some(ImageFormat::Jpeg)
    } else if header.starts_with(b"GIF87a") || header.starts_with(b"GIF89a") {
        Some(ImageFormat::Gif)
    } else if header.len() >= 12
        && &header[..4] == b"RIFF"
        && &header[8..12] == b"WEBP"
    {
        Some(ImageFormat::Webp)
    } else if header.starts_with(b"BM") {
        Some(ImageFormat::Bmp)
    } else {
        None
    }
}

/// Read the start of `path` and check it is a supported image.
///
/// `Ok(None)` means the file is readable but not decodable.
pub fn decode(path: &Path) -> Result<Option<ImageFormat>> {
    let mut header = [0u8; 16];
    let mut file = std::fs::File::open(path)?;
    let mut filled = 0;
    while filled < header.len() {
        match file.read(&mut header[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(sniff_format(&header[..filled]))
}

fn accept_term(term: &str, min_length: usize) -> bool {
    term.chars().count() >= min_length
        && term.chars().next().is_some_and(char::is_alphabetic)
        && !tokenizer::is_stop_word(term)
}

/// Turn raw annotator output into stored terms.
///
/// OCR lines and labels are split with the same tokenizer that store
/// queries go through, so a multi-word label is stored word by word.
/// Labels must first reach the label confidence threshold. Every term
/// must start with a letter, must not be a stop word and must be at
/// least `min_term_length` characters long.
pub fn extract_terms(
    kind: AnnotatorKind,
    annotations: &[Annotation],
    config: &IngestConfig,
) -> BTreeSet<String> {
    annotations
        .iter()
        .filter(|annotation| {
            kind != AnnotatorKind::Labels
                || annotation
                    .confidence
                    .is_none_or(|c| c >= config.label_threshold)
        })
        .flat_map(|annotation| tokenizer::tokenize(&annotation.text))
        .filter(|word| accept_term(word, config.min_term_length))
        .collect()
}

/// Extract a title from file content.
///
/// Looks for the first markdown heading (line starting with `# `).
/// Falls back to the filename without extension.
pub fn extract_title(content: &str, file_path: &Path) -> String {
    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(heading) = trimmed.strip_prefix("# ") {
            let title = heading.trim();
            if !title.is_empty() {
                return title.to_string();
            }
        }
    }

    file_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("untitled")
        .to_string()
}

/// Weight of a text document's body relative to its title.
const BODY_WEIGHT: f64 = 0.5;

/// Load text files as in-memory [`Document`]s, title first.
///
/// Unreadable or non-UTF-8 files are skipped.
pub fn load_text_documents(files: &[DiscoveredFile]) -> Vec<Document> {
    files
        .par_iter()
        .filter_map(|file| {
            let content = std::fs::read_to_string(&file.absolute_path).ok()?;
            let title = extract_title(&content, &file.relative_path);
            let id = file.relative_path.to_string_lossy().to_string();
            Some(Document::new(id, vec![
                Content::new("title", title, 1.0),
                Content::new("body", content, BODY_WEIGHT),
            ]))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    #[test]
    fn probe_classifies_files() {
        let tmp = tempfile::tempdir().unwrap();
        let empty = tmp.path().join("empty.png");
        let big = tmp.path().join("big.png");
        let ok = tmp.path().join("ok.png");
        std::fs::write(&empty, "").unwrap();
        std::fs::write(&big, [0u8; 64]).unwrap();
        std::fs::write(&ok, PNG).unwrap();

        assert_eq!(probe(&tmp.path().join("nope.png"), 32), FileProbe::Gone);
        assert_eq!(probe(tmp.path(), 32), FileProbe::Gone);
        assert_eq!(probe(&empty, 32), FileProbe::Empty);
        assert_eq!(probe(&big, 32), FileProbe::TooLarge(64));
        assert!(matches!(
            probe(&ok, 32),
            FileProbe::Present { size, mtime } if size == PNG.len() as u64 && mtime > 0
        ));
    }

    #[test]
    fn sniffs_magic_bytes() {
        assert_eq!(sniff_format(PNG), Some(ImageFormat::Png));
        assert_eq!(sniff_format(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(ImageFormat::Jpeg));
        assert_eq!(sniff_format(b"GIF89a..."), Some(ImageFormat::Gif));
        assert_eq!(sniff_format(b"RIFF\0\0\0\0WEBPVP8 "), Some(ImageFormat::Webp));
        assert_eq!(sniff_format(b"BM\0\0"), Some(ImageFormat::Bmp));
        assert_eq!(sniff_format(b"hello world"), None);
        assert_eq!(sniff_format(b""), None);
    }

    #[test]
    fn decode_reads_header() {
        let tmp = tempfile::tempdir().unwrap();
        let good = tmp.path().join("a.png");
        let bad = tmp.path().join("b.png");
        std::fs::write(&good, PNG).unwrap();
        std::fs::write(&bad, "not an image").unwrap();

        assert_eq!(decode(&good).unwrap(), Some(ImageFormat::Png));
        assert_eq!(decode(&bad).unwrap(), None);
        assert!(decode(&tmp.path().join("missing.png")).is_err());
    }

    #[test]
    fn ocr_terms_are_filtered_words() {
        let config = IngestConfig::default();
        let terms = extract_terms(
            AnnotatorKind::Ocr,
            &[
                Annotation::new("TOTAL: 42.50 Groceries"),
                Annotation::new("the receipt, thank you"),
            ],
            &config,
        );
        let terms: Vec<_> = terms.into_iter().collect();
        assert_eq!(terms, vec!["groceries", "receipt", "thank", "total"]);
    }

    #[test]
    fn labels_respect_confidence() {
        let config = IngestConfig::default();
        let terms = extract_terms(
            AnnotatorKind::Labels,
            &[
                Annotation::with_confidence("Golden Retriever", 0.9),
                Annotation::with_confidence("Cat", 0.9),
                Annotation::with_confidence("Sunset", 0.2),
                Annotation::new("Beach"),
            ],
            &config,
        );
        let terms: Vec<_> = terms.into_iter().collect();
        assert_eq!(terms, vec!["beach", "golden", "retriever"]);
    }

    #[test]
    fn terms_are_split_like_queries() {
        let config = IngestConfig::default();
        let ocr = extract_terms(
            AnnotatorKind::Ocr,
            &[Annotation::new("A well-known SmartWatch")],
            &config,
        );
        let ocr: Vec<_> = ocr.into_iter().collect();
        assert_eq!(ocr, vec!["known", "smart", "watch", "well"]);

        let labels = extract_terms(
            AnnotatorKind::Labels,
            &[Annotation::with_confidence("Flat-screen TV", 0.9)],
            &config,
        );
        let labels: Vec<_> = labels.into_iter().collect();
        assert_eq!(labels, vec!["flat", "screen"]);
    }

    #[test]
    fn multi_word_label_is_searchable() {
        let mut store = crate::AnnotationStore::open_in_memory().unwrap();
        let terms = extract_terms(
            AnnotatorKind::Labels,
            &[Annotation::with_confidence("Golden Retriever", 0.9)],
            &IngestConfig::default(),
        );
        store
            .insert(&crate::ImageInfo::new("/dog.png", 1, terms))
            .unwrap();

        for query in ["golden", "retriever", "golden retriever"] {
            let hits = store.search(query, 10).unwrap();
            assert_eq!(hits.len(), 1, "{query}");
            assert_eq!(hits[0].path, std::path::PathBuf::from("/dog.png"));
        }
    }

    #[test]
    fn extract_title_from_heading() {
        let content = "# My Document\n\nSome body text.";
        assert_eq!(extract_title(content, Path::new("file.md")), "My Document");
    }

    #[test]
    fn extract_title_fallback_to_filename() {
        assert_eq!(extract_title("# \n\nno heading", Path::new("notes.md")), "notes");
        assert_eq!(extract_title("plain", Path::new("my-notes.md")), "my-notes");
    }

    #[test]
    fn loads_text_documents() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("hello.md"), "# Hello World\n\nGreetings.").unwrap();
        std::fs::write(tmp.path().join("raw.txt"), [0xFFu8, 0xFE, 0x00]).unwrap();

        let filter = crate::walker::FileFilter::new(["md", "txt"], Vec::new());
        let files = crate::walker::discover_files(tmp.path(), &filter).unwrap();
        let docs = load_text_documents(&files);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "hello.md");
        assert_eq!(docs[0].contents[0].text, "Hello World");
        assert_eq!(docs[0].contents[1].weight, 0.5);
    }
}
