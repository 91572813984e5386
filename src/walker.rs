use std::path::{Path, PathBuf};

use crate::{error::Result, incremental::file_mtime};

/// A discovered file eligible for ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    /// Path relative to the walked root directory.
    pub relative_path: PathBuf,
    /// Fully resolved absolute path.
    pub absolute_path: PathBuf,
    /// Last modification time as nanoseconds since the Unix epoch.
    pub mtime: i64,
}

/// Decides which paths are eligible for ingestion.
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    /// Lowercase extensions without the dot. Empty accepts every file.
    extensions: Vec<String>,
    /// Path prefixes that are never ingested.
    exclude: Vec<PathBuf>,
}

impl FileFilter {
    pub fn new<E, S>(extensions: E, exclude: Vec<PathBuf>) -> Self
    where
        E: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|ext| ext.as_ref().trim_start_matches('.').to_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect(),
            exclude,
        }
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        self.exclude.iter().any(|prefix| path.starts_with(prefix))
    }

    pub fn has_supported_extension(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
            })
    }

    /// Whether a file at `path` should be ingested.
    pub fn accepts(&self, path: &Path) -> bool {
        !self.is_excluded(path) && self.has_supported_extension(path)
    }
}

/// Recursively walk a directory and discover eligible files.
///
/// Skips hidden files/directories (names starting with `.`) and
/// excluded prefixes, and only returns files `filter` accepts.
pub fn discover_files(
    root: &Path,
    filter: &FileFilter,
) -> Result<Vec<DiscoveredFile>> {
    let canonical_root = root.canonicalize()?;
    let mut results = Vec::new();
    walk_dir(&canonical_root, &canonical_root, filter, &mut results)?;
    results.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(results)
}

fn walk_dir(
    root: &Path,
    current: &Path,
    filter: &FileFilter,
    results: &mut Vec<DiscoveredFile>,
) -> Result<()> {
    let entries = std::fs::read_dir(current)?;

    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        if file_name.to_string_lossy().starts_with('.') {
            continue;
        }

        let path = entry.path();
        if filter.is_excluded(&path) {
            continue;
        }

        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk_dir(root, &path, filter, results)?;
        } else if file_type.is_symlink() {
            let Ok(resolved) = path.canonicalize() else {
                continue;
            };
            // Directory links are never followed.
            if resolved.is_file() && filter.accepts(&resolved) {
                results.push(make_discovered(root, &path, &resolved)?);
            }
        } else if file_type.is_file() && filter.accepts(&path) {
            let abs = path.canonicalize()?;
            results.push(make_discovered(root, &path, &abs)?);
        }
    }

    Ok(())
}

fn make_discovered(
    root: &Path,
    original_path: &Path,
    absolute_path: &Path,
) -> Result<DiscoveredFile> {
    let relative_path = original_path
        .strip_prefix(root)
        .unwrap_or(original_path)
        .to_path_buf();
    let mtime = file_mtime(&std::fs::metadata(absolute_path)?);

    Ok(DiscoveredFile {
        relative_path,
        absolute_path: absolute_path.to_path_buf(),
        mtime,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn images() -> FileFilter {
        FileFilter::new(["png", ".JPG"], Vec::new())
    }

    fn names(files: &[DiscoveredFile]) -> Vec<String> {
        files
            .iter()
            .map(|f| f.relative_path.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn discovers_allowed_extensions() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("cat.png"), "png").unwrap();
        std::fs::write(tmp.path().join("DOG.JPG"), "jpg").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "text").unwrap();

        let files = discover_files(tmp.path(), &images()).unwrap();
        assert_eq!(names(&files), vec!["DOG.JPG", "cat.png"]);
        assert!(files.iter().all(|f| f.mtime > 0));
    }

    #[test]
    fn skips_hidden_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let hidden = tmp.path().join(".cache");
        std::fs::create_dir(&hidden).unwrap();
        std::fs::write(hidden.join("thumb.png"), "png").unwrap();
        std::fs::write(tmp.path().join(".secret.png"), "png").unwrap();
        std::fs::write(tmp.path().join("visible.png"), "png").unwrap();

        let files = discover_files(tmp.path(), &images()).unwrap();
        assert_eq!(names(&files), vec!["visible.png"]);
    }

    #[test]
    fn recurses_and_honors_excludes() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let keep = root.join("keep");
        let skip = root.join("skip");
        std::fs::create_dir(&keep).unwrap();
        std::fs::create_dir(&skip).unwrap();
        std::fs::write(keep.join("a.png"), "png").unwrap();
        std::fs::write(skip.join("b.png"), "png").unwrap();

        let filter = FileFilter::new(["png"], vec![skip.clone()]);
        let files = discover_files(&root, &filter).unwrap();
        assert_eq!(names(&files), vec!["keep/a.png"]);
        assert_eq!(files[0].absolute_path, keep.join("a.png"));
        assert!(!filter.accepts(&skip.join("b.png")));
    }

    #[test]
    fn empty_extension_list_accepts_everything() {
        let filter = FileFilter::new(Vec::<String>::new(), Vec::new());
        assert!(filter.accepts(Path::new("/x/readme")));
        assert!(filter.accepts(Path::new("/x/a.bin")));
    }

    #[test]
    fn empty_directory() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(discover_files(tmp.path(), &images()).unwrap().is_empty());
    }
}
