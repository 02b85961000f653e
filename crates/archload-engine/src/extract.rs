//! Archive extraction.
//!
//! Extraction is archive-wide and idempotent: entries whose bytes already
//! match what is on disk are left untouched, others are written to a
//! uniquely named temporary sibling and renamed into place, so concurrent
//! extractions into one directory never observe a partial file.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;
use tokio::sync::{Mutex, OnceCell};

use crate::errors::IngestError;

/// What one extraction pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    /// File entries in the archive (directories excluded).
    pub entries: usize,
    pub written: usize,
    pub unchanged: usize,
}

/// Extract every entry of `archive` under `destination`, preserving
/// relative paths.
///
/// # Errors
///
/// Returns [`IngestError::Extraction`] if the archive is missing or corrupt,
/// an entry fails its CRC check, an entry path escapes `destination`, or a
/// file cannot be written.
pub fn extract_archive(archive: &Path, destination: &Path) -> Result<ExtractSummary, IngestError> {
    let fail = |reason: String| IngestError::Extraction {
        archive: archive.to_path_buf(),
        reason,
    };

    let file = File::open(archive).map_err(|e| fail(format!("cannot open archive: {e}")))?;
    let mut zip =
        zip::ZipArchive::new(file).map_err(|e| fail(format!("invalid zip archive: {e}")))?;

    fs::create_dir_all(destination)
        .map_err(|e| fail(format!("cannot create {}: {e}", destination.display())))?;

    let mut summary = ExtractSummary::default();
    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| fail(format!("cannot read entry {i}: {e}")))?;
        let name = entry.name().to_string();
        let Some(relative) = entry.enclosed_name() else {
            return Err(fail(format!("entry '{name}' escapes the extraction directory")));
        };
        let out_path = destination.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)
                .map_err(|e| fail(format!("cannot create {}: {e}", out_path.display())))?;
            continue;
        }

        // Reading to the end verifies the entry's CRC.
        let mut bytes = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or(0));
        entry
            .read_to_end(&mut bytes)
            .map_err(|e| fail(format!("entry '{name}': {e}")))?;

        summary.entries += 1;
        if matches_existing(&out_path, &bytes) {
            summary.unchanged += 1;
            continue;
        }
        write_atomically(&out_path, &bytes)
            .map_err(|e| fail(format!("cannot write {}: {e}", out_path.display())))?;
        summary.written += 1;
    }

    tracing::info!(
        archive = %archive.display(),
        destination = %destination.display(),
        entries = summary.entries,
        written = summary.written,
        unchanged = summary.unchanged,
        "Archive extracted"
    );
    Ok(summary)
}

/// Names of the file entries in `archive`, without extracting.
///
/// # Errors
///
/// Returns [`IngestError::Extraction`] if the archive cannot be opened.
pub fn list_entries(archive: &Path) -> Result<Vec<String>, IngestError> {
    let fail = |reason: String| IngestError::Extraction {
        archive: archive.to_path_buf(),
        reason,
    };
    let file = File::open(archive).map_err(|e| fail(format!("cannot open archive: {e}")))?;
    let mut zip =
        zip::ZipArchive::new(file).map_err(|e| fail(format!("invalid zip archive: {e}")))?;

    let mut names = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        let entry = zip
            .by_index_raw(i)
            .map_err(|e| fail(format!("cannot read entry {i}: {e}")))?;
        if !entry.is_dir() {
            names.push(entry.name().to_string());
        }
    }
    Ok(names)
}

fn matches_existing(path: &Path, bytes: &[u8]) -> bool {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() && meta.len() == bytes.len() as u64 => {
            fs::read(path).is_ok_and(|existing| existing == bytes)
        }
        _ => false,
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".archload-")
        .suffix(".tmp")
        .tempfile_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    persist(tmp, path)
}

fn persist(tmp: NamedTempFile, path: &Path) -> std::io::Result<()> {
    tmp.persist(path).map(drop).map_err(|e| e.error)
}

/// Extract-once cell shared by every pipeline of one cycle.
///
/// The first caller performs the extraction on the blocking pool; concurrent
/// callers wait for it. A failed extraction leaves the cell empty, so the
/// next caller (or a retry) extracts again.
///
/// Cells built with the same `lock` never extract at the same time, which
/// keeps separately triggered runs against one directory in sequence.
#[derive(Debug)]
pub struct SharedExtraction {
    archive: PathBuf,
    destination: PathBuf,
    lock: Arc<Mutex<()>>,
    cell: OnceCell<Arc<ExtractSummary>>,
}

impl SharedExtraction {
    #[must_use]
    pub fn new(archive: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self::with_lock(archive, destination, Arc::new(Mutex::new(())))
    }

    #[must_use]
    pub fn with_lock(
        archive: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            archive: archive.into(),
            destination: destination.into(),
            lock,
            cell: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Extract if no caller has yet succeeded.
    ///
    /// # Errors
    ///
    /// Returns the extraction failure of this attempt.
    pub async fn ensure(&self) -> Result<Arc<ExtractSummary>, IngestError> {
        let summary = self
            .cell
            .get_or_try_init(|| async {
                let _guard = self.lock.lock().await;
                let archive = self.archive.clone();
                let destination = self.destination.clone();
                match tokio::task::spawn_blocking(move || extract_archive(&archive, &destination))
                    .await
                {
                    Ok(result) => result.map(Arc::new),
                    Err(e) => Err(IngestError::Internal(format!("extraction task failed: {e}"))),
                }
            })
            .await?;
        Ok(Arc::clone(summary))
    }
}
