//! Process and filesystem primitives behind a mockable seam.
//!
//! Everything the connectivity helpers do to the OS — globbing `/dev` and
//! `/sys`, reading symlinks, writing sysfs control files, running external
//! commands — goes through the [`Executor`] trait so the multipath logic can
//! be exercised in tests without a SAN attached.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Poll interval while waiting for a child process to finish.
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[cfg_attr(test, automock)]
pub trait Executor: Send + Sync {
    /// Glob a filesystem pattern, returning the matched paths.
    fn filepath_glob(&self, pattern: &str) -> io::Result<Vec<PathBuf>>;

    /// Read the target of a symbolic link.
    fn os_read_link(&self, path: &str) -> io::Result<PathBuf>;

    /// Read a small text file (sysfs attribute, /proc entry) to a string.
    fn read_file(&self, path: &str) -> io::Result<String>;

    /// Append `content` to `path`, returning the number of bytes written.
    /// Sysfs control files interpret the write itself as the command.
    fn write_file(&self, path: &str, content: &str) -> io::Result<usize>;

    /// List the entry names of a directory.
    fn read_dir_names(&self, path: &str) -> io::Result<Vec<String>>;

    /// Whether a path exists at all.
    fn is_path_exists(&self, path: &str) -> bool;

    /// Open a file read-only and drop it, to probe for existence the way
    /// `open(2)` reports it.
    fn open_file(&self, path: &str) -> io::Result<()>;

    /// Run `command args...`, killing the child if it outlives `timeout_ms`.
    fn execute_with_timeout(
        &self,
        timeout_ms: u64,
        command: &str,
        args: &[String],
    ) -> io::Result<Output>;

    fn sleep(&self, duration: Duration);
}

/// Production [`Executor`] working against the real OS.
pub struct SystemExecutor;

impl SystemExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SystemExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for SystemExecutor {
    fn filepath_glob(&self, pattern: &str) -> io::Result<Vec<PathBuf>> {
        let paths = glob::glob(pattern)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let mut matches = Vec::new();
        for entry in paths {
            match entry {
                Ok(path) => matches.push(path),
                Err(e) => return Err(e.into_error()),
            }
        }
        Ok(matches)
    }

    fn os_read_link(&self, path: &str) -> io::Result<PathBuf> {
        std::fs::read_link(path)
    }

    fn read_file(&self, path: &str) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn write_file(&self, path: &str, content: &str) -> io::Result<usize> {
        use std::io::Write;

        let mut file = std::fs::OpenOptions::new().append(true).open(path)?;
        let written = file.write(content.as_bytes())?;
        Ok(written)
    }

    fn read_dir_names(&self, path: &str) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(path)? {
            names.push(entry?.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    fn is_path_exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    fn open_file(&self, path: &str) -> io::Result<()> {
        std::fs::File::open(path).map(|_| ())
    }

    fn execute_with_timeout(
        &self,
        timeout_ms: u64,
        command: &str,
        args: &[String],
    ) -> io::Result<Output> {
        debug!(command = %command, ?args, timeout_ms, "executing command");

        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if child.try_wait()?.is_some() {
                return child.wait_with_output();
            }
            if Instant::now() >= deadline {
                // Best effort: the child may have exited between try_wait
                // and kill.
                let _ = child.kill();
                let _ = child.wait();
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("command '{command}' timed out after {timeout_ms} ms"),
                ));
            }
            std::thread::sleep(CHILD_POLL_INTERVAL);
        }
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Build a [`DeviceConnectivityError`](super::errors::DeviceConnectivityError)
/// from a finished command's output when it exited non-zero.
pub(crate) fn command_failure(
    command: &str,
    args: &[String],
    output: &Output,
) -> super::errors::DeviceConnectivityError {
    super::errors::DeviceConnectivityError::CommandFailed {
        command: format!("{command} {}", args.join(" ")),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}
