use crate::domain::event::RequestEvent;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("storage budget exceeded: {current} + {incoming} > {budget} bytes")]
    StorageFull {
        current: u64,
        incoming: u64,
        budget: u64,
    },
}

/// Events loaded from disk, together with the snapshot file that must be
/// deleted once a flush containing them succeeds.
#[derive(Debug)]
pub struct RecoveredBatch {
    pub events: Vec<RequestEvent>,
    pub recovering_path: PathBuf,
}

/// Append-only overflow log for undeliverable batches.
///
/// Each line is the JSON array serialization of one batched send; single
/// event objects are tolerated on read. The file never grows past the byte
/// budget; writes beyond it are refused.
#[derive(Debug, Clone)]
pub struct DiskStore {
    path: PathBuf,
    max_bytes: u64,
}

impl DiskStore {
    pub fn new(path: PathBuf, max_bytes: u64) -> Self {
        Self { path, max_bytes }
    }

    /// Overflow location used when none is configured: the system temp
    /// directory, keyed by a digest of the endpoint so distinct endpoints
    /// never share a file.
    pub fn default_path(endpoint: &str) -> PathBuf {
        let digest = Sha256::digest(endpoint.as_bytes());
        let key: String = digest[..6].iter().map(|b| format!("{b:02x}")).collect();
        std::env::temp_dir().join(format!("apilens-events-{key}.jsonl"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling path the live file is renamed to during recovery.
    pub fn recovering_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".recovering");
        PathBuf::from(name)
    }

    /// Appends one batch as a single line, refusing writes that would push
    /// the file past the byte budget.
    pub fn persist_batch(&self, events: &[RequestEvent]) -> Result<(), StorageError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut line = serde_json::to_vec(&events)?;
        line.push(b'\n');

        let current = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if current + line.len() as u64 > self.max_bytes {
            return Err(StorageError::StorageFull {
                current,
                incoming: line.len() as u64,
                budget: self.max_bytes,
            });
        }

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&self.path)?;
        file.write_all(&line)?;

        tracing::debug!(
            count = events.len(),
            bytes = line.len(),
            path = %self.path.display(),
            "persisted batch to overflow file"
        );
        Ok(())
    }

    /// Loads previously persisted events, at most `limit` of them.
    ///
    /// Probes the `.recovering` snapshot first, then the live file; only the
    /// first existing one is read. A freshly read live file is renamed to
    /// the snapshot path (unlinked when the rename fails, so the same events
    /// are never loaded twice). The returned snapshot path must be deleted
    /// by the caller after the next successful flush.
    pub fn recover(&self, limit: usize) -> Result<Option<RecoveredBatch>, StorageError> {
        if limit == 0 {
            return Ok(None);
        }

        let recovering = self.recovering_path();

        for candidate in [recovering.clone(), self.path.clone()] {
            if !candidate.exists() {
                continue;
            }

            let events = read_events(&candidate, limit)?;

            if candidate == self.path {
                if let Err(e) = fs::rename(&self.path, &recovering) {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        "failed to move overflow file aside, unlinking instead"
                    );
                    let _ = fs::remove_file(&self.path);
                }
            }

            tracing::debug!(
                count = events.len(),
                path = %candidate.display(),
                "recovered events from disk"
            );
            return Ok(Some(RecoveredBatch {
                events,
                recovering_path: recovering,
            }));
        }

        Ok(None)
    }
}

fn read_events(path: &Path, limit: usize) -> Result<Vec<RequestEvent>, StorageError> {
    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);
    let mut events = Vec::new();

    for line in reader.lines() {
        if events.len() >= limit {
            break;
        }
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "stopping overflow read");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<serde_json::Value>(&line) {
            Ok(serde_json::Value::Array(items)) => {
                for item in items {
                    if events.len() >= limit {
                        break;
                    }
                    match serde_json::from_value::<RequestEvent>(item) {
                        Ok(event) => events.push(event),
                        Err(e) => tracing::debug!(error = %e, "skipping malformed event"),
                    }
                }
            }
            Ok(item @ serde_json::Value::Object(_)) => {
                match serde_json::from_value::<RequestEvent>(item) {
                    Ok(event) => events.push(event),
                    Err(e) => tracing::debug!(error = %e, "skipping malformed event"),
                }
            }
            Ok(_) | Err(_) => {
                tracing::debug!(path = %path.display(), "skipping unparseable overflow line");
            }
        }
    }

    Ok(events)
}
