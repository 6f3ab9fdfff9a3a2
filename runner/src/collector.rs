use crate::config::{ConfigErrors, InputSet};
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use std::{path::PathBuf, vec};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
/// Input files of one `InputSet`, sorted by path
/// These should be initialized from `Collector::load`
pub struct Collector {
    // (root the file was found under, path of the file)
    entries: vec::IntoIter<(PathBuf, PathBuf)>,
}

impl Collector {
    pub fn load(config: &InputSet) -> Result<Self, ConfigErrors> {
        let roots = config.roots();
        if roots.is_empty() {
            warn!("Input set for {} has no paths", config.glob);
        }

        let matcher = config.glob.compile_matcher();
        debug!("Filtering with glob: {:?}", config.glob);

        // walk every root on its own so each file stays relative to where it was found
        let mut entries = Vec::new();
        for root in roots.iter() {
            let mut builder = WalkBuilder::new(root);
            builder
                .standard_filters(false)
                .max_depth(if config.recursive { None } else { Some(1) });

            entries.extend(
                builder
                    .build()
                    .filter_map(|entry| match entry {
                        Ok(entry) => Some(entry),
                        Err(e) => {
                            warn!("Failed to search for inputs: {e}");
                            None
                        }
                    })
                    .filter(|entry| entry.file_type().map_or(false, |kind| kind.is_file()))
                    .filter(|entry| matcher.is_match(entry.file_name()))
                    .map(DirEntry::into_path)
                    .map(|path| (root.clone(), path)),
            );
        }

        let entries = entries
            .into_iter()
            .sorted_by(|(root_a, a), (root_b, b)| a.cmp(b).then_with(|| root_a.cmp(root_b)))
            .dedup_by(|(_, a), (_, b)| a == b)
            .collect_vec();

        debug!("Found {} files for {}", entries.len(), config.glob);

        Ok(Self {
            entries: entries.into_iter(),
        })
    }

    /// paths relative to the root they were found under, as handed to workers
    pub fn relative_paths(&self) -> Vec<String> {
        self.entries
            .as_slice()
            .iter()
            .filter_map(|(root, path)| match path.strip_prefix(root) {
                Ok(relative) => Some(relative.to_string_lossy().into_owned()),
                Err(_) => {
                    warn!("Input {path:?} is not below its root {root:?}, skipping it");
                    None
                }
            })
            .collect()
    }

    pub fn absolute_paths(&self) -> Result<Vec<String>, ConfigErrors> {
        self.entries
            .as_slice()
            .iter()
            .map(|(_, path)| -> Result<String, ConfigErrors> {
                Ok(path.canonicalize()?.to_string_lossy().into_owned())
            })
            .collect()
    }

    /// relative paths found under more than one root, these can not be told apart by workers
    pub fn duplicate_references(&self) -> Vec<String> {
        self.relative_paths().into_iter().duplicates().collect()
    }
}

impl Iterator for Collector {
    type Item = PathBuf;

    /// return accurate size for underlying iterator
    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next().map(|(_, path)| path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use globset::Glob;
    use std::fs;

    fn input_set(paths: Vec<PathBuf>, glob: &str, recursive: bool) -> InputSet {
        InputSet {
            paths,
            path: None,
            glob: Glob::new(glob).unwrap(),
            recursive,
        }
    }

    #[test]
    fn matches_file_names_in_sorted_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.xinst", "a.xlayo", ".hidden.xinst", "readme.md"] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("c.xinst"), "").unwrap();

        let collector = Collector::load(&input_set(
            vec![dir.path().to_path_buf()],
            "*.{xinst,xlayo}",
            false,
        ))
        .unwrap();

        assert_eq!(collector.size_hint(), (3, Some(3)));
        assert_eq!(
            collector.relative_paths(),
            vec![".hidden.xinst", "a.xlayo", "b.xinst"]
        );
        assert!(collector.duplicate_references().is_empty());
    }

    #[test]
    fn recursive_sets_keep_the_nested_path() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("c.xinst"), "").unwrap();
        fs::write(dir.path().join("top.xinst"), "").unwrap();

        let collector =
            Collector::load(&input_set(vec![dir.path().to_path_buf()], "*.xinst", true)).unwrap();

        // resolving the reference against the root finds the file again
        let references = collector.relative_paths();
        assert_eq!(references, vec!["nested/c.xinst", "top.xinst"]);
        assert!(references
            .iter()
            .all(|reference| dir.path().join(reference).is_file()));

        assert_eq!(
            collector.collect_vec(),
            vec![dir.path().join("nested/c.xinst"), dir.path().join("top.xinst")]
        );
    }

    #[test]
    fn same_name_under_two_roots_is_reported() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        for dir in [&first, &second] {
            fs::write(dir.path().join("x.xinst"), "").unwrap();
        }
        fs::write(first.path().join("y.xinst"), "").unwrap();

        let collector = Collector::load(&input_set(
            vec![first.path().to_path_buf(), second.path().to_path_buf()],
            "*.xinst",
            false,
        ))
        .unwrap();

        assert_eq!(collector.absolute_paths().unwrap().len(), 3);
        assert_eq!(collector.duplicate_references(), vec!["x.xinst"]);
    }

    #[test]
    fn root_listed_twice_yields_each_file_once() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("x.xinst"), "").unwrap();

        let collector = Collector::load(&input_set(
            vec![dir.path().to_path_buf(), dir.path().to_path_buf()],
            "*.xinst",
            false,
        ))
        .unwrap();

        assert_eq!(collector.relative_paths(), vec!["x.xinst"]);
        assert!(collector.duplicate_references().is_empty());
    }
}
