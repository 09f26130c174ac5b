use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::cidr::Cidr;
use crate::error::{CniError, Result};
use crate::ipam::{FileLedger, DEFAULT_LEDGER_PATH};
use crate::naming::IFNAME_MAX_LEN;
use crate::topology::{
    VxlanSpec, DEFAULT_BRIDGE_NAME, DEFAULT_VXLAN_GROUP, DEFAULT_VXLAN_NAME, DEFAULT_VXLAN_VNI,
    VXLAN_UDP_PORT,
};

/// CNI spec version this plugin speaks
pub const CNI_VERSION: &str = "1.0.0";
/// Versions reported by VERSION
pub const SUPPORTED_VERSIONS: &[&str] = &["1.0.0"];

/// Placeholder replaced with the node's pod subnet when rendering a template
pub const SUBNET_PLACEHOLDER: &str = "{{SUBNET}}";

/// Largest VXLAN network identifier (24 bits)
const VNI_MAX: u32 = (1 << 24) - 1;

/// Install locations for the plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SknfConfig {
    /// Path to the CNI bin directory
    pub cni_bin_dir: PathBuf,
    /// Path to the CNI config directory
    pub cni_conf_dir: PathBuf,
    /// File name of the plugin binary inside `cni_bin_dir`
    pub plugin_name: String,
    /// File name of the network config inside `cni_conf_dir`
    pub conf_name: String,
}

impl Default for SknfConfig {
    fn default() -> Self {
        Self {
            cni_bin_dir: PathBuf::from("/opt/cni/bin"),
            cni_conf_dir: PathBuf::from("/etc/cni/net.d"),
            plugin_name: "sknf".to_string(),
            conf_name: "10-sknf.conf".to_string(),
        }
    }
}

/// Network configuration handed to the plugin on stdin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConf {
    /// CNI specification version
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Name of the network
    pub name: String,
    /// Type of CNI plugin
    #[serde(rename = "type")]
    pub plugin_type: String,
    /// Pod subnet of this node
    pub subnet: String,
    /// Pod network of the whole cluster
    #[serde(rename = "clusterCidr")]
    pub cluster_cidr: String,
    /// Physical interface VXLAN and masquerade traffic leave through
    #[serde(rename = "hostPhysicalInterface")]
    pub host_physical_interface: String,
    #[serde(default = "default_bridge")]
    pub bridge: String,
    #[serde(default)]
    pub vxlan: VxlanConf,
    #[serde(default)]
    pub ledger: LedgerConf,
    /// Load br_netfilter and enable its sysctls on ADD
    #[serde(rename = "brNetfilter", default)]
    pub br_netfilter: bool,
}

fn default_bridge() -> String {
    DEFAULT_BRIDGE_NAME.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VxlanConf {
    #[serde(default = "default_vxlan_name")]
    pub name: String,
    #[serde(default = "default_vni")]
    pub vni: u32,
    #[serde(default = "default_group")]
    pub group: Ipv4Addr,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_vxlan_name() -> String {
    DEFAULT_VXLAN_NAME.to_string()
}

fn default_vni() -> u32 {
    DEFAULT_VXLAN_VNI
}

fn default_group() -> Ipv4Addr {
    DEFAULT_VXLAN_GROUP
}

fn default_port() -> u16 {
    VXLAN_UDP_PORT
}

impl Default for VxlanConf {
    fn default() -> Self {
        Self {
            name: default_vxlan_name(),
            vni: default_vni(),
            group: default_group(),
            port: default_port(),
        }
    }
}

/// Where the last-issued address is kept
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConf {
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,
    /// Serialize concurrent allocations with an exclusive file lock
    #[serde(default)]
    pub lock: bool,
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from(DEFAULT_LEDGER_PATH)
}

impl Default for LedgerConf {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
            lock: false,
        }
    }
}

fn check_ifname(field: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CniError::InvalidConfig(format!("{} must not be empty", field)));
    }
    if name.len() > IFNAME_MAX_LEN {
        return Err(CniError::InvalidConfig(format!(
            "{} '{}' is longer than {} bytes",
            field, name, IFNAME_MAX_LEN
        )));
    }
    Ok(())
}

impl NetConf {
    /// Parse NetConf from bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let conf: NetConf = serde_json::from_slice(bytes)
            .map_err(|e| CniError::InvalidConfig(format!("Failed to parse network configuration: {}", e)))?;

        if !SUPPORTED_VERSIONS.contains(&conf.cni_version.as_str()) {
            return Err(CniError::InvalidConfig(format!(
                "Unsupported cniVersion {}",
                conf.cni_version
            )));
        }

        check_ifname("hostPhysicalInterface", &conf.host_physical_interface)?;
        check_ifname("bridge", &conf.bridge)?;
        check_ifname("vxlan.name", &conf.vxlan.name)?;

        if conf.vxlan.vni > VNI_MAX {
            return Err(CniError::InvalidConfig(format!(
                "Invalid VNI {} (must fit in 24 bits)",
                conf.vxlan.vni
            )));
        }

        conf.node_subnet()?;
        conf.cluster_subnet()?;

        Ok(conf)
    }

    /// Create a configuration with every optional field at its default
    pub fn new_default(name: &str, subnet: &str, cluster_cidr: &str, uplink: &str) -> Self {
        Self {
            cni_version: CNI_VERSION.to_string(),
            name: name.to_string(),
            plugin_type: "sknf".to_string(),
            subnet: subnet.to_string(),
            cluster_cidr: cluster_cidr.to_string(),
            host_physical_interface: uplink.to_string(),
            bridge: default_bridge(),
            vxlan: VxlanConf::default(),
            ledger: LedgerConf::default(),
            br_netfilter: false,
        }
    }

    pub fn node_subnet(&self) -> Result<Cidr> {
        Cidr::parse(&self.subnet)
    }

    pub fn cluster_subnet(&self) -> Result<Cidr> {
        Cidr::parse(&self.cluster_cidr)
    }

    pub fn vxlan_spec(&self) -> VxlanSpec {
        VxlanSpec {
            name: self.vxlan.name.clone(),
            vni: self.vxlan.vni,
            group: self.vxlan.group,
            port: self.vxlan.port,
        }
    }

    pub fn file_ledger(&self) -> FileLedger {
        FileLedger::new(&self.ledger.path).locked(self.ledger.lock)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write network configuration to {}", path.display()))?;
        Ok(())
    }
}

/// Substitute the node's pod subnet into a config template
pub fn render_template(template: &str, subnet: &str) -> String {
    template.replace(SUBNET_PLACEHOLDER, subnet)
}

/// Installer for the sknf CNI plugin
pub struct Installer {
    config: SknfConfig,
}

impl Installer {
    /// Create a new installer
    pub fn new(config: SknfConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SknfConfig {
        &self.config
    }

    /// Copy the plugin binary into the CNI bin directory as an executable
    pub fn install_binary(&self, binary: &Path) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.config.cni_bin_dir)
            .with_context(|| format!("Failed to create directory: {}", self.config.cni_bin_dir.display()))?;

        let target = self.config.cni_bin_dir.join(&self.config.plugin_name);
        fs::copy(binary, &target).with_context(|| {
            format!(
                "Failure copying CNI plugin binary from {} to {}",
                binary.display(),
                target.display()
            )
        })?;
        fs::set_permissions(&target, fs::Permissions::from_mode(0o755))
            .with_context(|| format!("Failed to set permissions on {}", target.display()))?;

        info!("Installed plugin binary to {}", target.display());
        Ok(target)
    }

    /// Render `template` for `subnet` into the CNI config directory
    pub fn install_config(&self, template: &str, subnet: &str) -> anyhow::Result<PathBuf> {
        Cidr::parse(subnet).with_context(|| format!("Invalid node subnet {}", subnet))?;

        fs::create_dir_all(&self.config.cni_conf_dir)
            .with_context(|| format!("Failed to create directory: {}", self.config.cni_conf_dir.display()))?;

        let target = self.config.cni_conf_dir.join(&self.config.conf_name);
        fs::write(&target, render_template(template, subnet))
            .with_context(|| format!("Failed to write CNI config to {}", target.display()))?;

        info!("Wrote network configuration to {}", target.display());
        Ok(target)
    }

    /// Install the binary and render the config
    pub fn install(&self, binary: &Path, template: &str, subnet: &str) -> anyhow::Result<()> {
        self.install_binary(binary)?;
        self.install_config(template, subnet)?;
        Ok(())
    }
}
