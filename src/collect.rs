//! File collection: the list of paths a run will process.

use ignore::{DirEntry, WalkBuilder};
use log::{debug, warn};
use std::path::{Path, PathBuf};

use crate::engine::tools::should_include_in_walk;
use crate::error::{PipelineError, PipelineResult};
use crate::utils::config::{CollectorConfig, PackagePaths};

/// Source of the files a run aggregates.
pub trait FileCollector: Send + Sync {
    fn collect(&self, root: &Path) -> PipelineResult<Vec<PathBuf>>;
}

/// Fixed list of paths, e.g. a caller that already knows what to aggregate.
impl FileCollector for Vec<PathBuf> {
    fn collect(&self, _root: &Path) -> PipelineResult<Vec<PathBuf>> {
        Ok(self.clone())
    }
}

/// Walks the tree with the `ignore` crate: gitignore rules, hidden-file and ignore-dir
/// filtering, exclude globs, size cap. Results are sorted by file name per directory.
pub struct WalkCollector {
    config: CollectorConfig,
    skip: Vec<PathBuf>,
}

impl WalkCollector {
    pub fn new(config: CollectorConfig) -> Self {
        WalkCollector {
            config,
            skip: Vec::new(),
        }
    }

    /// Never collect `path` (the output file when it lives inside the source tree).
    pub fn skip_path(mut self, path: PathBuf) -> Self {
        self.skip.push(path);
        self
    }

    fn walker(&self, root: &Path) -> ignore::Walk {
        let c = &self.config;
        let ignore_dirs = c.ignore_dirs.clone();
        WalkBuilder::new(root)
            .hidden(!c.include_hidden)
            .follow_links(c.follow_links)
            .git_ignore(c.respect_gitignore)
            .git_global(c.respect_gitignore)
            .git_exclude(c.respect_gitignore)
            .ignore(c.respect_gitignore)
            .parents(c.respect_gitignore)
            .require_git(false)
            .filter_entry(move |e: &DirEntry| {
                let is_dir = e.file_type().is_some_and(|t| t.is_dir());
                !(is_dir
                    && e.depth() > 0
                    && e.file_name()
                        .to_str()
                        .is_some_and(|n| ignore_dirs.iter().any(|d| d == n)))
            })
            .sort_by_file_name(|a, b| a.cmp(b))
            .build()
    }
}

impl FileCollector for WalkCollector {
    fn collect(&self, root: &Path) -> PipelineResult<Vec<PathBuf>> {
        if !root.is_dir() {
            return Err(PipelineError::Collect {
                root: root.to_path_buf(),
                message: "not a directory".to_string(),
            });
        }
        let mut exclude = PackagePaths::get().default_exclude_patterns();
        exclude.extend(self.config.exclude.iter().cloned());

        let mut files = Vec::new();
        let mut skipped = 0usize;
        for result in self.walker(root) {
            let entry = match result {
                Ok(e) => e,
                Err(err) => {
                    debug!("walk: {}", err);
                    skipped += 1;
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            let path = entry.path();
            if !should_include_in_walk(path, root, &self.skip, &exclude) {
                continue;
            }
            match entry.metadata() {
                Ok(meta) if meta.len() > self.config.max_file_size => {
                    debug!("walk: {} larger than {} bytes", path.display(), self.config.max_file_size);
                }
                Ok(_) => files.push(entry.into_path()),
                Err(err) => {
                    debug!("walk: {}", err);
                    skipped += 1;
                }
            }
        }
        if skipped > 0 {
            warn!(
                "Skipped {} paths due to permission errors or access issues",
                skipped
            );
        }
        debug!("collected {} files under {}", files.len(), root.display());
        Ok(files)
    }
}
