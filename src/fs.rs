//! File-system seam. The bridge never touches the disk directly: everything
//! goes through a [`FileAccessor`] so the session can run inside a sandboxed
//! host that routes file access elsewhere.

use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

const EXISTS_POLL_INTERVAL: Duration = Duration::from_millis(25);

pub trait FileAccessor: Send + Sync {
    fn read_file(&self, path: &str) -> io::Result<String>;

    fn write_file(&self, path: &str, data: &[u8]) -> io::Result<()>;

    fn delete_file(&self, path: &str) -> io::Result<()>;

    /// Wait until `path` exists, up to `timeout`. Returns false on timeout.
    fn check_exists(&self, path: &str, timeout: Duration) -> bool;
}

/// [`FileAccessor`] over the local file system.
#[derive(Debug, Default)]
pub struct NativeAccessor;

impl FileAccessor for NativeAccessor {
    fn read_file(&self, path: &str) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn write_file(&self, path: &str, data: &[u8]) -> io::Result<()> {
        std::fs::write(path, data)
    }

    fn delete_file(&self, path: &str) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn check_exists(&self, path: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if Path::new(path).exists() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(EXISTS_POLL_INTERVAL);
        }
    }
}
