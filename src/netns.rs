//! Network namespace handles and the switch/restore critical section.
//!
//! `setns(CLONE_NEWNET)` changes the namespace of the calling thread only, and
//! netlink sockets bind to whatever namespace was active when they were
//! opened. A request issued while the wrong namespace is active lands there
//! silently, so every switch is scoped by a [`NetnsGuard`] that puts the
//! thread back when it goes out of scope, including on early returns.

use nix::sched::{setns, CloneFlags};
use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{CniError, Result};

/// Namespace of the calling thread
const THREAD_NETNS_PATH: &str = "/proc/thread-self/ns/net";

/// An open network namespace file
#[derive(Debug)]
pub struct Netns {
    file: File,
    path: PathBuf,
}

impl Netns {
    /// Open a namespace by path, e.g. `/var/run/netns/<name>` or `/proc/<pid>/ns/net`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            CniError::io(
                "Failure opening target net namespace fd",
                path.display().to_string(),
                e,
            )
        })?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// The namespace the calling thread is in right now
    pub fn current() -> Result<Self> {
        Self::open(THREAD_NETNS_PATH)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Second handle on the same namespace, for handing to another thread
    pub fn try_clone(&self) -> Result<Self> {
        let file = self.file.try_clone().map_err(|e| {
            CniError::io(
                "Failure duplicating net namespace fd",
                self.path.display().to_string(),
                e,
            )
        })?;

        Ok(Self {
            file,
            path: self.path.clone(),
        })
    }

    /// Switch the calling thread into this namespace until the guard drops
    pub fn enter(&self) -> Result<NetnsGuard> {
        let original = Netns::current()?;

        setns(self.file.as_raw_fd(), CloneFlags::CLONE_NEWNET).map_err(|e| {
            CniError::namespace(
                "Failure associating thread to container's net ns",
                self.path.display().to_string(),
                e,
            )
        })?;
        debug!("Entered network namespace {}", self.path.display());

        Ok(NetnsGuard {
            original,
            restored: false,
        })
    }

    /// Run `f` with the calling thread switched into this namespace
    pub fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let guard = self.enter()?;
        let result = f();

        // A failed restore only wins if `f` itself succeeded
        match (result, guard.restore()) {
            (Err(e), Err(restore)) => {
                warn!("Failed to restore namespace after error: {}", restore);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(_), Err(e)) => Err(e),
            (Ok(value), Ok(())) => Ok(value),
        }
    }
}

impl AsRawFd for Netns {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Holds the namespace to return to; switches back on drop
#[must_use = "the namespace is restored as soon as the guard is dropped"]
pub struct NetnsGuard {
    original: Netns,
    restored: bool,
}

impl NetnsGuard {
    /// Switch back now and report whether it worked
    pub fn restore(mut self) -> Result<()> {
        self.restored = true;
        self.switch_back()
    }

    fn switch_back(&self) -> Result<()> {
        setns(self.original.file.as_raw_fd(), CloneFlags::CLONE_NEWNET).map_err(|e| {
            CniError::namespace(
                "Failure re-associating thread to main net ns",
                self.original.path.display().to_string(),
                e,
            )
        })?;
        debug!("Restored network namespace");
        Ok(())
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        if let Err(e) = self.switch_back() {
            warn!("Best-effort namespace restore failed: {}", e);
        }
    }
}
