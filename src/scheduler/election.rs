// ABOUTME: Leader election through an exclusively created lock file holding the leader's PID
// ABOUTME: Stale files left by dead processes are removed and the election retried

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Attempts at claiming the lock file before giving up.
const MAX_ATTEMPTS: u32 = 3;

/// A lock file without a readable PID younger than this is assumed to be
/// mid-write by a live competitor.
const PARTIAL_WRITE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum ElectionOutcome {
    Leader(LeaderGuard),
    /// Another live process holds the lock file.
    Follower { leader_pid: Option<i32> },
}

impl ElectionOutcome {
    pub fn is_leader(&self) -> bool {
        matches!(self, ElectionOutcome::Leader(_))
    }
}

/// Held by the elected process. Dropping it removes the lock file, provided
/// the file still names this process.
#[derive(Debug)]
pub struct LeaderGuard {
    path: PathBuf,
    pid: i32,
}

impl LeaderGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        match read_pid(&self.path) {
            Ok(Some(pid)) if pid == self.pid => {
                if let Err(e) = fs::remove_file(&self.path) {
                    tracing::warn!("Failed to remove scheduler lock file {:?}: {}", self.path, e);
                } else {
                    tracing::info!("Released scheduler lock file {:?}", self.path);
                }
            }
            Ok(_) => {
                tracing::warn!(
                    "Scheduler lock file {:?} no longer names this process; leaving it",
                    self.path
                );
            }
            Err(e) => tracing::debug!("Could not read scheduler lock file on release: {:?}", e),
        }
    }
}

/// Try to become the single scheduler leader for `lock_path`.
pub fn elect(lock_path: &Path) -> Result<ElectionOutcome> {
    elect_as(lock_path, std::process::id() as i32)
}

fn elect_as(lock_path: &Path, pid: i32) -> Result<ElectionOutcome> {
    if let Some(parent) = lock_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create lock directory: {:?}", parent))?;
        }
    }

    for attempt in 1..=MAX_ATTEMPTS {
        match OpenOptions::new().write(true).create_new(true).open(lock_path) {
            Ok(mut file) => {
                file.write_all(pid.to_string().as_bytes())
                    .and_then(|_| file.sync_all())
                    .with_context(|| format!("Failed to write PID to {:?}", lock_path))?;
                tracing::info!("Elected scheduler leader (PID {}) via {:?}", pid, lock_path);
                return Ok(ElectionOutcome::Leader(LeaderGuard {
                    path: lock_path.to_path_buf(),
                    pid,
                }));
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to create lock file {:?}", lock_path))
            }
        }

        match read_pid(lock_path) {
            Ok(Some(holder)) if is_process_running(holder) => {
                tracing::debug!("Scheduler already led by PID {}", holder);
                return Ok(ElectionOutcome::Follower {
                    leader_pid: Some(holder),
                });
            }
            Ok(Some(holder)) => {
                tracing::warn!(
                    "Removing stale scheduler lock file {:?} (PID {} is not running, attempt {}/{})",
                    lock_path,
                    holder,
                    attempt,
                    MAX_ATTEMPTS
                );
            }
            Ok(None) if recently_modified(lock_path) => {
                return Ok(ElectionOutcome::Follower { leader_pid: None });
            }
            Ok(None) => {
                tracing::warn!("Removing unreadable scheduler lock file {:?}", lock_path);
            }
            // Vanished between create and read: retry the create
            Err(_) if !lock_path.exists() => continue,
            Err(e) => return Err(e),
        }

        match fs::remove_file(lock_path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to remove stale lock file {:?}", lock_path))
            }
        }
    }

    tracing::warn!(
        "Gave up scheduler election after {} attempts; another process keeps claiming {:?}",
        MAX_ATTEMPTS,
        lock_path
    );
    Ok(ElectionOutcome::Follower { leader_pid: None })
}

/// PID of the live leader recorded at `lock_path`, if any.
pub fn current_leader(lock_path: &Path) -> Option<i32> {
    if !lock_path.exists() {
        return None;
    }
    read_pid(lock_path)
        .ok()
        .flatten()
        .filter(|pid| is_process_running(*pid))
}

/// PID recorded in the lock file, or `None` when it is empty or not a number.
fn read_pid(path: &Path) -> Result<Option<i32>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read lock file: {:?}", path))?;
    Ok(content.trim().parse::<i32>().ok().filter(|pid| *pid > 0))
}

fn recently_modified(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map(|age| age < PARTIAL_WRITE_GRACE)
        .unwrap_or(true)
}

/// Check if a process with the given PID is running.
#[cfg(unix)]
pub fn is_process_running(pid: i32) -> bool {
    // Signal 0 checks the pid without delivering anything; EPERM means it exists
    // under another user.
    let result = unsafe { libc::kill(pid, 0) };
    result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Without a portable liveness check the holder is assumed alive, so a stale file
/// must be removed by hand.
#[cfg(not(unix))]
pub fn is_process_running(_pid: i32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_first_process_becomes_leader() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scheduler.lock");

        let outcome = elect(&path).unwrap();
        assert!(outcome.is_leader());
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );
    }

    #[test]
    fn test_live_holder_makes_follower() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scheduler.lock");

        let _leader = elect(&path).unwrap();
        match elect(&path).unwrap() {
            ElectionOutcome::Follower { leader_pid } => {
                assert_eq!(leader_pid, Some(std::process::id() as i32))
            }
            ElectionOutcome::Leader(_) => panic!("second election must not win"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_stale_pid_is_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scheduler.lock");
        // PIDs are capped well below i32::MAX on every supported kernel
        fs::write(&path, i32::MAX.to_string()).unwrap();

        let outcome = elect(&path).unwrap();
        assert!(outcome.is_leader());
    }

    #[test]
    fn test_fresh_empty_file_counts_as_live() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scheduler.lock");
        fs::write(&path, "").unwrap();

        match elect(&path).unwrap() {
            ElectionOutcome::Follower { leader_pid } => assert_eq!(leader_pid, None),
            ElectionOutcome::Leader(_) => panic!("partial file must be respected"),
        }
    }

    #[test]
    fn test_drop_removes_only_own_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scheduler.lock");

        let guard = match elect(&path).unwrap() {
            ElectionOutcome::Leader(guard) => guard,
            _ => panic!("expected leadership"),
        };
        drop(guard);
        assert!(!path.exists());

        let guard = match elect(&path).unwrap() {
            ElectionOutcome::Leader(guard) => guard,
            _ => panic!("expected leadership"),
        };
        fs::write(&path, "1").unwrap();
        drop(guard);
        assert!(path.exists());
    }

    #[test]
    fn test_current_leader_reports_live_holder() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scheduler.lock");
        assert_eq!(current_leader(&path), None);

        let _guard = elect(&path).unwrap();
        assert_eq!(current_leader(&path), Some(std::process::id() as i32));
    }

    #[test]
    fn test_creates_missing_parent_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("scheduler.lock");
        assert!(elect_as(&path, 42).unwrap().is_leader());
    }
}
