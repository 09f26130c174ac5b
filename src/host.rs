//! Host preparation outside the overlay itself.
//!
//! Containers on the same bridge talk to each other without ever crossing
//! the IP layer, so netfilter only sees that traffic once `br_netfilter` is
//! loaded and its sysctls are on.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

use crate::error::{CniError, Result};

const PROC_SYS: &str = "/proc/sys";
const BRIDGE_NF_SYSCTLS: [&str; 2] = [
    "net/bridge/bridge-nf-call-iptables",
    "net/bridge/bridge-nf-call-ip6tables",
];

/// Writes `br_netfilter` sysctls under a `/proc/sys`-like root
#[derive(Debug, Clone)]
pub struct HostPrep {
    sysctl_root: PathBuf,
    load_module: bool,
}

impl Default for HostPrep {
    fn default() -> Self {
        Self {
            sysctl_root: PathBuf::from(PROC_SYS),
            load_module: true,
        }
    }
}

impl HostPrep {
    /// Use `root` instead of `/proc/sys` and skip `modprobe`
    pub fn with_sysctl_root(root: impl Into<PathBuf>) -> Self {
        Self {
            sysctl_root: root.into(),
            load_module: false,
        }
    }

    pub fn sysctl_root(&self) -> &Path {
        &self.sysctl_root
    }

    /// Load `br_netfilter` and switch on bridge-nf-call-ip{,6}tables.
    ///
    /// The module load is best effort since it may be built in. The sysctl
    /// writes are not.
    pub fn enable_br_netfilter(&self) -> Result<()> {
        if self.load_module {
            load_br_netfilter();
        }

        for sysctl in BRIDGE_NF_SYSCTLS {
            write_sysctl(&self.sysctl_root.join(sysctl), "1\n")?;
        }

        info!("Enabled br_netfilter sysctls");
        Ok(())
    }
}

fn load_br_netfilter() {
    let status = Command::new("modprobe")
        .arg("br_netfilter")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => debug!("Loaded br_netfilter"),
        Ok(status) => warn!("modprobe br_netfilter exited with {}, assuming built in", status),
        Err(e) => warn!("Could not run modprobe: {}, assuming br_netfilter is built in", e),
    }
}

fn write_sysctl(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value)
        .map_err(|e| CniError::io("Failure writing sysctl", path.display().to_string(), e))?;
    debug!("Set {} = {}", path.display(), value.trim_end());
    Ok(())
}
