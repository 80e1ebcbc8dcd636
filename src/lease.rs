//! Single-flight cycle lease
//!
//! At most one Ranker/Mutator/Coordinator cycle runs at a time. The lease is a
//! small JSON file created with `create_new` (O_EXCL) so two processes cannot
//! both win; it carries a TTL so a crashed holder stops wedging future cycles
//! once the TTL lapses. Contention is not an error condition for the caller:
//! the losing invocation exits cleanly as a no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum LeaseError {
    /// Another cycle already holds a live lease
    #[error("Cycle lease is held by {holder} until {expires_at}")]
    Contended {
        holder: Uuid,
        expires_at: DateTime<Utc>,
    },

    #[error("Lease I/O error on `{path}`: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Lease file `{path}` is unreadable: {source}")]
    Corrupt {
        path: String,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeaseRecord {
    holder: Uuid,
    acquired_at: DateTime<Utc>,
    ttl_secs: u64,
}

impl LeaseRecord {
    fn expires_at(&self) -> DateTime<Utc> {
        self.acquired_at + chrono::Duration::seconds(self.ttl_secs as i64)
    }
}

/// A held cycle lease. Released explicitly at cycle end; `Drop` releases
/// best-effort as a backstop.
pub struct CycleLease {
    path: PathBuf,
    holder: Uuid,
    released: bool,
}

impl CycleLease {
    /// Try to acquire the lease at `path` with the given TTL.
    ///
    /// An existing lease that has outlived its TTL is treated as abandoned and
    /// replaced; a live one yields [`LeaseError::Contended`].
    pub fn acquire<P: AsRef<Path>>(path: P, ttl_secs: u64) -> Result<Self, LeaseError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| LeaseError::Io {
            path: path.display().to_string(),
            source,
        };

        let record = LeaseRecord {
            holder: Uuid::new_v4(),
            acquired_at: Utc::now(),
            ttl_secs,
        };
        let serialized = serde_json::to_string(&record).expect("lease record serializes");

        // Takeover of an expired lease deletes the stale file and retries the
        // exclusive create, so two processes racing on the same expired lease
        // still end with a single winner.
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    file.write_all(serialized.as_bytes()).map_err(io_err)?;
                    log::debug!("Acquired cycle lease {} as {}", path.display(), record.holder);
                    return Ok(Self {
                        path,
                        holder: record.holder,
                        released: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let content = match std::fs::read_to_string(&path) {
                        Ok(content) => content,
                        // A racing holder released between our open and read
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                        Err(e) => return Err(io_err(e)),
                    };
                    let existing: LeaseRecord =
                        serde_json::from_str(&content).map_err(|source| LeaseError::Corrupt {
                            path: path.display().to_string(),
                            source,
                        })?;

                    if existing.expires_at() > Utc::now() {
                        return Err(LeaseError::Contended {
                            holder: existing.holder,
                            expires_at: existing.expires_at(),
                        });
                    }

                    // Expired: the previous holder crashed. Remove the stale
                    // file and loop back to the exclusive create.
                    log::warn!(
                        "Removing expired cycle lease held by {} (expired {})",
                        existing.holder,
                        existing.expires_at()
                    );
                    match std::fs::remove_file(&path) {
                        Ok(()) => {}
                        // Another contender removed it first; retry anyway
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(io_err(e)),
                    }
                }
                Err(e) => return Err(io_err(e)),
            }
        }
    }

    pub fn holder(&self) -> Uuid {
        self.holder
    }

    /// Release the lease, deleting the file if we still own it.
    pub fn release(mut self) -> Result<(), LeaseError> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<(), LeaseError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        // Only delete a file we still own; a TTL takeover may have replaced it
        let still_ours = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|content| serde_json::from_str::<LeaseRecord>(&content).ok())
            .map(|record| record.holder == self.holder)
            .unwrap_or(false);

        if still_ours {
            std::fs::remove_file(&self.path).map_err(|source| LeaseError::Io {
                path: self.path.display().to_string(),
                source,
            })?;
        }
        Ok(())
    }
}

impl Drop for CycleLease {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            log::warn!("Failed to release cycle lease on drop: {}", e);
        }
    }
}
