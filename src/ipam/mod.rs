//! Host-local address allocation.
//!
//! The bridge takes the first host address of the node subnet and containers
//! are handed out sequentially after it. Every address is rendered with the
//! cluster-wide prefix length so containers on other hosts are on-link
//! neighbours across the overlay rather than behind a gateway.
//!
//! The last-issued address lives in a [`Ledger`]. The default
//! [`FileLedger`] is unlocked: two plugin invocations on the same host can
//! race on the read-modify-write and hand out the same address. Setting
//! `ledger.lock` in the network configuration takes an exclusive `flock`
//! around the update instead.

use nix::fcntl::{flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::cidr::Cidr;
use crate::error::{CniError, Result};

/// Default location of the last-issued container address
pub const DEFAULT_LEDGER_PATH: &str = "/tmp/sknf-cni-ips";

/// Persistent record of the last-issued container address
pub trait Ledger {
    /// Run one read-modify-write cycle.
    ///
    /// `update` receives the stored value (trailing whitespace trimmed), or
    /// `None` if nothing was stored yet, and returns the value to persist.
    fn update(&self, update: &mut dyn FnMut(Option<&str>) -> Result<String>) -> Result<String>;

    /// Current stored value without modifying it
    fn peek(&self) -> Result<Option<String>>;
}

/// Ledger stored as a single line of text in a file
#[derive(Debug, Clone)]
pub struct FileLedger {
    path: PathBuf,
    lock: bool,
}

impl FileLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: false,
        }
    }

    /// Serialize updates across processes with an exclusive flock
    pub fn locked(mut self, lock: bool) -> Self {
        self.lock = lock;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    fn read(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(contents.trim_end().to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CniError::io(
                "Failure reading IP ledger",
                self.path.display().to_string(),
                e,
            )),
        }
    }

    fn write(&self, value: &str) -> Result<()> {
        fs::write(&self.path, value).map_err(|e| {
            CniError::io(
                "Failure writing IP ledger",
                self.path.display().to_string(),
                e,
            )
        })
    }
}

/// Exclusive flock held for the lifetime of the guard
struct LedgerLock {
    // Closing the descriptor releases the lock
    _file: File,
}

impl LedgerLock {
    fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .map_err(|e| CniError::io("Failure opening IP ledger lock", path.display().to_string(), e))?;

        flock(file.as_raw_fd(), FlockArg::LockExclusive).map_err(|e| {
            CniError::io(
                "Failure locking IP ledger",
                path.display().to_string(),
                std::io::Error::from(e),
            )
        })?;

        debug!("Acquired IP ledger lock {}", path.display());
        Ok(Self { _file: file })
    }
}

impl Ledger for FileLedger {
    fn update(&self, update: &mut dyn FnMut(Option<&str>) -> Result<String>) -> Result<String> {
        let _guard = if self.lock {
            Some(LedgerLock::acquire(&self.lock_path())?)
        } else {
            None
        };

        let current = self.read()?;
        let next = update(current.as_deref())?;
        self.write(&next)?;
        Ok(next)
    }

    fn peek(&self) -> Result<Option<String>> {
        self.read()
    }
}

/// Derives bridge and container addresses from the configured subnets
pub struct IpAllocator<L: Ledger> {
    ledger: L,
}

impl<L: Ledger> IpAllocator<L> {
    pub fn new(ledger: L) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Hand out the next container address and persist it.
    ///
    /// With no ledger entry the sequence starts right after the bridge
    /// address. No check is made that the result still lies inside
    /// `node_subnet`; past the end it keeps counting.
    pub fn acquire_container_address(&self, node_subnet: &Cidr, cluster_subnet: &Cidr) -> Result<Cidr> {
        let stored = self.ledger.update(&mut |last: Option<&str>| -> Result<String> {
            let base = match last {
                Some(text) => {
                    debug!("Last issued address from ledger: {}", text);
                    Cidr::parse(text)?
                }
                None => {
                    info!("IP ledger is empty, seeding from node subnet {}", node_subnet);
                    first_allocable(node_subnet, cluster_subnet)?
                }
            };

            let next = base.offset(1).with_prefix(cluster_subnet.prefix_len())?;
            if !node_subnet.contains(next.address()) {
                warn!("Allocated address {} is outside node subnet {}", next, node_subnet);
            }
            Ok(next.to_string())
        })?;

        Cidr::parse(&stored)
    }

    /// Last address recorded in the ledger, if any
    pub fn last_issued(&self) -> Result<Option<Cidr>> {
        self.ledger.peek()?.map(|text| Cidr::parse(&text)).transpose()
    }
}

/// First host address of `subnet`, carrying the cluster-wide prefix length.
pub fn first_allocable(subnet: &Cidr, cluster_subnet: &Cidr) -> Result<Cidr> {
    Cidr::new(subnet.network(), subnet.prefix_len())?
        .offset(1)
        .with_prefix(cluster_subnet.prefix_len())
}

/// Bridge address for this node: first host of the node subnet.
pub fn bridge_address(node_subnet: &Cidr, cluster_subnet: &Cidr) -> Result<Cidr> {
    first_allocable(node_subnet, cluster_subnet)
}
