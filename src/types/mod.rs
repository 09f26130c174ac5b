use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;

use crate::error::{CniError, Result as CniResult};

/// CNI command arguments
#[derive(Debug, Clone)]
pub struct CmdArgs {
    /// Container ID
    pub container_id: String,
    /// Network namespace path
    pub netns: String,
    /// Interface name
    pub ifname: String,
    /// `CNI_ARGS` pairs, e.g. `K8S_POD_NAMESPACE` and `K8S_POD_NAME`
    pub args: HashMap<String, String>,
    /// Standard input data
    pub stdin_data: Vec<u8>,
}

/// Current result format (CNI 1.0.0)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Result {
    /// CNI specification version
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Interfaces created
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<Vec<Interface>>,
    /// IP configurations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ips: Option<Vec<IPConfig>>,
    /// Routes to configure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<Route>>,
}

/// Interface information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    /// Interface name
    pub name: String,
    /// MAC address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Sandbox path (network namespace); unset for host-side devices
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

/// IP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IPConfig {
    /// Always "4"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Interface index this IP is assigned to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
    /// IP address with prefix length
    pub address: String,
    /// Gateway
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

/// Route configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    /// Destination CIDR
    pub dst: String,
    /// Gateway for this route
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}

/// Answer to VERSION
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResult {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    #[serde(rename = "supportedVersions")]
    pub supported_versions: Vec<String>,
}

impl Result {
    /// Create a new empty result
    pub fn new(cni_version: &str) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            interfaces: None,
            ips: None,
            routes: None,
        }
    }

    /// Add an interface and return its index in the result
    pub fn add_interface(&mut self, interface: Interface) -> usize {
        let interfaces = self.interfaces.get_or_insert_with(Vec::new);
        interfaces.push(interface);
        interfaces.len() - 1
    }

    /// Add an IP configuration to the result
    pub fn add_ip(&mut self, ip: IPConfig) {
        self.ips.get_or_insert_with(Vec::new).push(ip);
    }

    /// Add a route to the result
    pub fn add_route(&mut self, route: Route) {
        self.routes.get_or_insert_with(Vec::new).push(route);
    }

    /// Address assigned to the first IP entry
    pub fn primary_address(&self) -> Option<&str> {
        self.ips
            .as_ref()
            .and_then(|ips| ips.first())
            .map(|ip| ip.address.as_str())
    }

    /// Write result as JSON
    pub fn write_to(&self, out: &mut impl Write) -> CniResult<()> {
        write_json(self, out)
    }
}

impl VersionResult {
    pub fn new(cni_version: &str, supported: &[&str]) -> Self {
        Self {
            cni_version: cni_version.to_string(),
            supported_versions: supported.iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn write_to(&self, out: &mut impl Write) -> CniResult<()> {
        write_json(self, out)
    }
}

fn write_json<T: Serialize>(value: &T, out: &mut impl Write) -> CniResult<()> {
    let json = serde_json::to_string(value).map_err(|e| {
        CniError::io(
            "Failure serializing CNI response",
            "stdout",
            std::io::Error::other(e),
        )
    })?;
    writeln!(out, "{}", json).map_err(|e| CniError::io("Failure writing CNI response", "stdout", e))
}
