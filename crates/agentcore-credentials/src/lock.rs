// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Advisory cross-process exclusive lock on the credentials file (§4.7),
//! with bounded retries and a stale-lock TTL so a crashed holder cannot
//! wedge every other process forever.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs4::FileExt;
use tracing::warn;

const STALE_LOCK_TTL: Duration = Duration::from_secs(30);
const RETRY_INTERVAL: Duration = Duration::from_millis(100);
const MAX_WAIT: Duration = Duration::from_secs(10);

/// Held while a refresh is in flight. Dropping it releases the OS-level
/// advisory lock; the lock file itself is left in place (its mtime is the
/// staleness signal for the next acquirer).
pub struct LockGuard {
    file: File,
    lock_path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

/// Acquire the lock for `credentials_path`, blocking the calling thread.
/// Call via `tokio::task::spawn_blocking` from async contexts.
///
/// If a stale lock (older than [`STALE_LOCK_TTL`]) is found, it is broken
/// and `Ok` is returned the same as a clean acquisition — the two cases are
/// not distinguished in the return value. Callers that need to treat a
/// broken-stale-lock acquisition as suspect (e.g. preferring the
/// compromised-lock callback over writing blindly) must detect that
/// independently, the way `store.rs`'s compromised-lock check does.
pub fn acquire(credentials_path: &Path) -> anyhow::Result<LockGuard> {
    let lock_path = lock_path_for(credentials_path);
    let file = OpenOptions::new().create(true).write(true).truncate(false).open(&lock_path)?;

    let deadline = Instant::now() + MAX_WAIT;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(LockGuard { file, lock_path }),
            Err(_) => {
                if is_stale(&lock_path) {
                    warn!(path = %lock_path.display(), "breaking stale credentials lock");
                    return Ok(LockGuard { file, lock_path });
                }
                if Instant::now() >= deadline {
                    anyhow::bail!("timed out waiting for credentials lock at {}", lock_path.display());
                }
                std::thread::sleep(RETRY_INTERVAL);
            }
        }
    }
}

fn lock_path_for(credentials_path: &Path) -> PathBuf {
    let mut path = credentials_path.to_path_buf();
    let name = format!("{}.lock", path.file_name().and_then(|n| n.to_str()).unwrap_or("auth.json"));
    path.set_file_name(name);
    path
}

fn is_stale(lock_path: &Path) -> bool {
    std::fs::metadata(lock_path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .map(|age| age > STALE_LOCK_TTL)
        .unwrap_or(false)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
