//! Dataset store answering exact whole-line membership queries.
//!
//! Two interchangeable strategies:
//! - `Cached`: the file is read once at startup into a `HashSet`. Lookups
//!   are pure in-memory operations and never fail.
//! - `Reread`: every lookup opens the file and streams it from the start,
//!   so the answer always reflects the current on-disk content. Each lookup
//!   owns its file handle; nothing is shared between concurrent queries.
//!
//! Both strategies normalize dataset lines the same way (see
//! [`normalize_line`]), so for a static file they give identical answers.

use crate::error::DatasetError;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, trace, warn};

/// Read buffer size for streaming the dataset in reread mode
const REREAD_BUFFER_SIZE: usize = 64 * 1024;

/// Which lookup strategy a store uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetMode {
    Cached,
    Reread,
}

/// Dataset store shared by all connections
#[derive(Debug)]
pub enum DatasetStore {
    Cached(CachedDataset),
    Reread(RereadDataset),
}

impl DatasetStore {
    /// Open the dataset at `path` with the requested strategy.
    ///
    /// Fails if the file cannot be read, in either mode.
    pub async fn open(path: &Path, reread_on_query: bool) -> Result<Self, DatasetError> {
        if reread_on_query {
            RereadDataset::open(path).await.map(DatasetStore::Reread)
        } else {
            CachedDataset::load(path).await.map(DatasetStore::Cached)
        }
    }

    /// Check whether `candidate` equals some normalized dataset line.
    pub async fn contains(&self, candidate: &str) -> Result<bool, DatasetError> {
        match self {
            DatasetStore::Cached(dataset) => Ok(dataset.contains(candidate)),
            DatasetStore::Reread(dataset) => dataset.contains(candidate).await,
        }
    }

    pub fn mode(&self) -> DatasetMode {
        match self {
            DatasetStore::Cached(_) => DatasetMode::Cached,
            DatasetStore::Reread(_) => DatasetMode::Reread,
        }
    }
}

/// Normalize one raw dataset line for comparison.
///
/// Returns `None` for lines that can never match a query: invalid UTF-8, or
/// empty once surrounding whitespace (including `\r`) is trimmed.
pub fn normalize_line(raw: &[u8]) -> Option<&str> {
    let line = std::str::from_utf8(raw).ok()?.trim();
    if line.is_empty() {
        None
    } else {
        Some(line)
    }
}

/// Dataset held in memory for the lifetime of the process
#[derive(Debug)]
pub struct CachedDataset {
    lines: HashSet<String>,
}

impl CachedDataset {
    /// Read and index the whole file.
    pub async fn load(path: &Path) -> Result<Self, DatasetError> {
        let contents = tokio::fs::read(path)
            .await
            .map_err(|source| DatasetError::Load {
                path: path.to_path_buf(),
                source,
            })?;

        let dataset = Self::from_bytes(&contents);
        info!(
            path = %path.display(),
            bytes = contents.len(),
            lines = dataset.len(),
            "Loaded dataset into memory"
        );
        if dataset.is_empty() {
            warn!(path = %path.display(), "Dataset contains no searchable lines");
        }
        Ok(dataset)
    }

    /// Index raw file contents.
    pub fn from_bytes(contents: &[u8]) -> Self {
        let mut skipped = 0usize;
        let lines = contents
            .split(|&b| b == b'\n')
            .filter_map(|raw| {
                let line = normalize_line(raw);
                if line.is_none() && !raw.is_empty() {
                    skipped += 1;
                }
                line
            })
            .map(str::to_owned)
            .collect();

        if skipped > 0 {
            debug!(skipped, "Ignored blank or non-UTF-8 dataset lines");
        }

        Self { lines }
    }

    pub fn contains(&self, candidate: &str) -> bool {
        self.lines.contains(candidate)
    }

    /// Number of distinct lines
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Dataset read from disk on every lookup
#[derive(Debug)]
pub struct RereadDataset {
    path: PathBuf,
}

impl RereadDataset {
    /// Create a reread store after checking the file can be opened now.
    pub async fn open(path: &Path) -> Result<Self, DatasetError> {
        File::open(path).await.map_err(|source| DatasetError::Load {
            path: path.to_path_buf(),
            source,
        })?;

        info!(path = %path.display(), "Dataset will be reread on every query");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Stream the file and stop at the first matching line.
    pub async fn contains(&self, candidate: &str) -> Result<bool, DatasetError> {
        let lookup_error = |source: std::io::Error| DatasetError::Lookup {
            path: self.path.clone(),
            source,
        };

        let file = File::open(&self.path).await.map_err(lookup_error)?;
        let mut reader = BufReader::with_capacity(REREAD_BUFFER_SIZE, file);
        let mut line = Vec::with_capacity(256);
        let mut scanned = 0usize;

        loop {
            line.clear();
            let n = reader
                .read_until(b'\n', &mut line)
                .await
                .map_err(lookup_error)?;
            if n == 0 {
                trace!(scanned, "Dataset exhausted without a match");
                return Ok(false);
            }
            scanned += 1;

            if normalize_line(&line) == Some(candidate) {
                trace!(scanned, "Dataset match");
                return Ok(true);
            }
        }
    }
}
