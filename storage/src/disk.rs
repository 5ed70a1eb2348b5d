//! WAL directory pressure watchdog

use metrics::gauge;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::{error, warn};

/// Pressure level, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiskLevel {
    /// Plenty of room
    Ok,
    /// Worth an operator's attention
    Warn,
    /// Per-topic policies apply
    Critical,
    /// All writes stop
    Halt,
}

impl DiskLevel {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Ok,
            1 => Self::Warn,
            2 => Self::Critical,
            _ => Self::Halt,
        }
    }

    const fn as_u8(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Warn => 1,
            Self::Critical => 2,
            Self::Halt => 3,
        }
    }
}

/// Shared view of the current level
#[derive(Clone)]
pub struct DiskLevelHandle(Arc<AtomicU8>);

impl DiskLevelHandle {
    /// Current level
    #[must_use]
    pub fn get(&self) -> DiskLevel {
        DiskLevel::from_u8(self.0.load(Ordering::Acquire))
    }
}

/// Polls WAL directory usage and publishes the level
pub struct DiskPressureMonitor {
    dir: PathBuf,
    warn_bytes: u64,
    critical_bytes: u64,
    halt_bytes: u64,
    level: Arc<AtomicU8>,
}

impl DiskPressureMonitor {
    /// Create a monitor over `dir` with the configured thresholds
    #[must_use]
    pub fn new(dir: PathBuf, warn_bytes: u64, critical_bytes: u64, halt_bytes: u64) -> Self {
        Self {
            dir,
            warn_bytes,
            critical_bytes,
            halt_bytes,
            level: Arc::new(AtomicU8::new(DiskLevel::Ok.as_u8())),
        }
    }

    /// Handle for readers (the recorder)
    #[must_use]
    pub fn handle(&self) -> DiskLevelHandle {
        DiskLevelHandle(Arc::clone(&self.level))
    }

    /// One poll: measure, classify, publish
    pub fn poll(&self) -> DiskLevel {
        let used = self.dir_bytes();
        let next = if used >= self.halt_bytes {
            DiskLevel::Halt
        } else if used >= self.critical_bytes {
            DiskLevel::Critical
        } else if used >= self.warn_bytes {
            DiskLevel::Warn
        } else {
            DiskLevel::Ok
        };

        let previous = DiskLevel::from_u8(self.level.swap(next.as_u8(), Ordering::AcqRel));
        if next != previous {
            match next {
                DiskLevel::Halt => error!(used, "WAL disk pressure HALT, all writes stop"),
                DiskLevel::Critical => warn!(used, "WAL disk pressure CRITICAL"),
                DiskLevel::Warn => warn!(used, "WAL disk pressure WARN"),
                DiskLevel::Ok => tracing::info!(used, "WAL disk pressure cleared"),
            }
        }
        gauge!("wal_dir_bytes").set(used as f64);
        gauge!("wal_disk_level").set(f64::from(next.as_u8()));
        next
    }

    fn dir_bytes(&self) -> u64 {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        entries
            .filter_map(Result::ok)
            .filter_map(|e| e.metadata().ok())
            .filter(|m| m.is_file())
            .map(|m| m.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_follow_usage() {
        let tmp = tempfile::tempdir().unwrap();
        let monitor = DiskPressureMonitor::new(tmp.path().to_path_buf(), 100, 200, 300);
        let handle = monitor.handle();

        assert_eq!(monitor.poll(), DiskLevel::Ok);
        assert_eq!(handle.get(), DiskLevel::Ok);

        std::fs::write(tmp.path().join("a.wal"), vec![0u8; 150]).unwrap();
        assert_eq!(monitor.poll(), DiskLevel::Warn);

        std::fs::write(tmp.path().join("b.wal"), vec![0u8; 100]).unwrap();
        assert_eq!(monitor.poll(), DiskLevel::Critical);

        std::fs::write(tmp.path().join("c.wal"), vec![0u8; 100]).unwrap();
        assert_eq!(monitor.poll(), DiskLevel::Halt);
        assert_eq!(handle.get(), DiskLevel::Halt);

        std::fs::remove_file(tmp.path().join("b.wal")).unwrap();
        std::fs::remove_file(tmp.path().join("c.wal")).unwrap();
        assert_eq!(monitor.poll(), DiskLevel::Warn);
    }
}
