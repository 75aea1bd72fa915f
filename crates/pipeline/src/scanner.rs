//! Data directory scanning.
//!
//! Walks the data directory and maps each file to the remote container it
//! belongs to, following the configured [`FolderStructure`].

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use glob::Pattern;
use mydata_model::FileCandidate;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::{DirEntry, FilterEntry, WalkDir};

use crate::error::PipelineError;

/// How leading directory levels map to a remote container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderStructure {
    /// `<dataset>/...`
    Dataset,
    /// `<username>/<dataset>/...`
    #[default]
    UsernameDataset,
    /// `<email>/<dataset>/...`
    EmailDataset,
    /// `<experiment>/<dataset>/...`
    ExperimentDataset,
    /// `<username>/<experiment>/<dataset>/...`
    UsernameExperimentDataset,
    /// `<email>/<experiment>/<dataset>/...`
    EmailExperimentDataset,
    /// `<user group>/<instrument>/<full name>/<dataset>/...`
    UserGroupInstrumentFullNameDataset,
}

impl FolderStructure {
    /// Number of leading directories that name the container.
    pub fn container_depth(self) -> usize {
        match self {
            Self::Dataset => 1,
            Self::UsernameDataset | Self::EmailDataset | Self::ExperimentDataset => 2,
            Self::UsernameExperimentDataset | Self::EmailExperimentDataset => 3,
            Self::UserGroupInstrumentFullNameDataset => 4,
        }
    }
}

/// Scan filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanOptions {
    #[serde(default)]
    pub structure: FolderStructure,
    /// File name globs; when non-empty a file must match one of them.
    #[serde(default)]
    pub includes: Vec<String>,
    /// File name globs that exclude a file.
    #[serde(default)]
    pub excludes: Vec<String>,
    /// Skip files and directories whose name starts with a dot.
    #[serde(default = "default_true")]
    pub skip_hidden: bool,
    /// Skip files modified more recently than this, they may still be
    /// being written.
    #[serde(default)]
    pub ignore_newer_than: Option<Duration>,
}

fn default_true() -> bool {
    true
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            structure: FolderStructure::default(),
            includes: Vec::new(),
            excludes: Vec::new(),
            skip_hidden: true,
            ignore_newer_than: None,
        }
    }
}

/// Produces [`FileCandidate`]s for a data directory.
#[derive(Debug, Clone)]
pub struct FolderScanner {
    root: PathBuf,
    options: ScanOptions,
    includes: Vec<Pattern>,
    excludes: Vec<Pattern>,
}

impl FolderScanner {
    /// Compiles the filters. Fails on an invalid glob.
    pub fn new(root: impl Into<PathBuf>, options: ScanOptions) -> Result<Self, PipelineError> {
        let compile = |globs: &[String]| -> Result<Vec<Pattern>, PipelineError> {
            globs
                .iter()
                .map(|g| Pattern::new(g).map_err(PipelineError::from))
                .collect()
        };
        Ok(Self {
            root: root.into(),
            includes: compile(&options.includes)?,
            excludes: compile(&options.excludes)?,
            options,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fails when the root is missing, unreadable or not a directory.
    pub fn check_root(&self) -> Result<(), PipelineError> {
        let meta = std::fs::metadata(&self.root)
            .map_err(|_| PipelineError::RootMissing(self.root.clone()))?;
        if !meta.is_dir() {
            return Err(PipelineError::RootNotDirectory(self.root.clone()));
        }
        std::fs::read_dir(&self.root)
            .map_err(|_| PipelineError::RootMissing(self.root.clone()))?;
        Ok(())
    }

    /// Starts a walk. The root is checked up front; problems below it are
    /// logged and skipped.
    pub fn scan(&self) -> Result<Candidates<'_>, PipelineError> {
        self.check_root()?;

        let hidden: fn(&DirEntry) -> bool = if self.options.skip_hidden {
            |e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.')
        } else {
            |_| true
        };
        let walk = WalkDir::new(&self.root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(hidden);

        Ok(Candidates {
            scanner: self,
            walk,
            skipped: 0,
            now: SystemTime::now(),
        })
    }

    fn name_allowed(&self, name: &str) -> bool {
        if !self.includes.is_empty() && !self.includes.iter().any(|p| p.matches(name)) {
            return false;
        }
        !self.excludes.iter().any(|p| p.matches(name))
    }
}

/// Lazy sequence of candidates from one walk.
pub struct Candidates<'a> {
    scanner: &'a FolderScanner,
    walk: FilterEntry<walkdir::IntoIter, fn(&DirEntry) -> bool>,
    skipped: usize,
    now: SystemTime,
}

impl Candidates<'_> {
    /// Files passed over so far (filtered, unreadable or misplaced).
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn candidate(&self, entry: &DirEntry) -> Option<FileCandidate> {
        let scanner = self.scanner;
        let rel = entry.path().strip_prefix(&scanner.root).ok()?;
        let segments: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let (filename, dirs) = segments.split_last()?;

        let depth = scanner.options.structure.container_depth();
        if dirs.len() < depth {
            debug!(path = %entry.path().display(), "file is above the dataset level");
            return None;
        }
        if !scanner.name_allowed(filename) {
            debug!(path = %entry.path().display(), "file filtered out");
            return None;
        }

        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "cannot stat file");
                return None;
            }
        };
        if let Some(min_age) = scanner.options.ignore_newer_than {
            let age = meta
                .modified()
                .ok()
                .and_then(|m| self.now.duration_since(m).ok())
                .unwrap_or_default();
            if age < min_age {
                debug!(path = %entry.path().display(), "file modified too recently");
                return None;
            }
        }

        Some(FileCandidate {
            path: entry.path().to_path_buf(),
            container: dirs[..depth].join("/"),
            subdirectory: dirs[depth..].join("/"),
            size: meta.len(),
        })
    }
}

impl Iterator for Candidates<'_> {
    type Item = FileCandidate;

    fn next(&mut self) -> Option<FileCandidate> {
        loop {
            let entry = match self.walk.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable entry");
                    self.skipped += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            match self.candidate(&entry) {
                Some(c) => return Some(c),
                None => self.skipped += 1,
            }
        }
    }
}
