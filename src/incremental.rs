use std::{
    collections::HashMap,
    fs::Metadata,
    path::PathBuf,
    time::SystemTime,
};

use rayon::prelude::*;

use crate::walker::DiscoveredFile;

/// Modification time of a file as nanoseconds since the Unix epoch.
///
/// Platforms without modification times report 0, so such files are
/// re-annotated on every scan.
pub fn file_mtime(meta: &Metadata) -> i64 {
    meta.modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

/// Result of comparing files on disk against the annotation store.
#[derive(Debug, Default)]
pub struct DiffResult {
    /// Files with no stored record.
    pub new_files: Vec<DiscoveredFile>,
    /// Files whose stored modification time differs.
    pub changed_files: Vec<DiscoveredFile>,
    /// Files whose stored record is current.
    pub unchanged: usize,
    /// Stored paths that no longer exist on disk.
    pub missing: Vec<PathBuf>,
}

impl DiffResult {
    /// Files that need (re-)annotation, new ones first.
    pub fn pending(&self) -> impl Iterator<Item = &DiscoveredFile> {
        self.new_files.iter().chain(&self.changed_files)
    }
}

/// Compare discovered files against stored modification times.
///
/// `known` may hold paths from other roots: a stored path counts as
/// missing only when it no longer exists, not when the walk skipped it.
pub fn diff_with_store(
    known: &HashMap<PathBuf, i64>,
    discovered: &[DiscoveredFile],
) -> DiffResult {
    let mut result = DiffResult::default();

    for file in discovered {
        match known.get(&file.absolute_path) {
            None => result.new_files.push(file.clone()),
            Some(stored) if *stored != file.mtime => {
                result.changed_files.push(file.clone());
            }
            Some(_) => result.unchanged += 1,
        }
    }

    result.missing = missing_paths(known.keys());
    result
}

/// Stored paths whose file is gone, checked in parallel.
pub fn missing_paths<'a>(
    paths: impl IntoIterator<Item = &'a PathBuf>,
) -> Vec<PathBuf> {
    let paths: Vec<&PathBuf> = paths.into_iter().collect();
    let mut missing: Vec<PathBuf> = paths
        .par_iter()
        .filter(|path| !path.is_file())
        .map(|path| (*path).clone())
        .collect();
    missing.sort();
    missing
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn make_file(path: &Path, mtime: i64) -> DiscoveredFile {
        DiscoveredFile {
            relative_path: PathBuf::from(path.file_name().unwrap()),
            absolute_path: path.to_path_buf(),
            mtime,
        }
    }

    #[test]
    fn mtime_of_fresh_file_is_recent() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.png");
        std::fs::write(&path, "x").unwrap();
        let mtime = file_mtime(&std::fs::metadata(&path).unwrap());
        // Later than 2020-01-01.
        assert!(mtime > 1_577_836_800_000_000_000);
    }

    #[test]
    fn diff_classifies_files() {
        let tmp = tempfile::tempdir().unwrap();
        let unchanged = tmp.path().join("same.png");
        let changed = tmp.path().join("changed.png");
        let new = tmp.path().join("new.png");
        for path in [&unchanged, &changed, &new] {
            std::fs::write(path, "x").unwrap();
        }
        let gone = tmp.path().join("gone.png");

        let known: HashMap<PathBuf, i64> = [
            (unchanged.clone(), 10),
            (changed.clone(), 10),
            (gone.clone(), 10),
        ]
        .into_iter()
        .collect();
        let discovered = vec![
            make_file(&unchanged, 10),
            make_file(&changed, 20),
            make_file(&new, 30),
        ];

        let diff = diff_with_store(&known, &discovered);
        assert_eq!(diff.new_files, vec![make_file(&new, 30)]);
        assert_eq!(diff.changed_files, vec![make_file(&changed, 20)]);
        assert_eq!(diff.unchanged, 1);
        assert_eq!(diff.missing, vec![gone]);

        let pending: Vec<_> =
            diff.pending().map(|f| f.absolute_path.clone()).collect();
        assert_eq!(pending, vec![new, changed]);
    }

    #[test]
    fn paths_outside_the_walk_are_kept_if_present() {
        let tmp = tempfile::tempdir().unwrap();
        let elsewhere = tmp.path().join("other-root.png");
        std::fs::write(&elsewhere, "x").unwrap();

        let known: HashMap<PathBuf, i64> =
            [(elsewhere, 1)].into_iter().collect();
        let diff = diff_with_store(&known, &[]);
        assert!(diff.missing.is_empty());
    }
}
