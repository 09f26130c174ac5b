//! ADD/DEL lifecycle for one container.
//!
//! ADD walks `Unattached -> AddressAcquired -> TopologyWired -> NatInstalled
//! -> Ready` and stops at the first failure, leaving whatever the failed step
//! created in place. DEL only removes the container's veth pair: the bridge,
//! the VXLAN device and the NAT rule are shared by every container on the
//! host.

use std::fmt;
use tracing::{error, info};

use crate::cidr::Cidr;
use crate::config::NetConf;
use crate::error::Result;
use crate::host::HostPrep;
use crate::ipam::{bridge_address, FileLedger, IpAllocator, Ledger};
use crate::nat::{NatRuleInstaller, NftTransport};
use crate::topology::{ContainerAttachment, LinkChannel, TopologyBuilder};
use crate::types::{CmdArgs, IPConfig, Interface, Result as CniResult, Route};

/// Progress of an ADD
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachState {
    Unattached,
    AddressAcquired,
    TopologyWired,
    NatInstalled,
    Ready,
}

impl fmt::Display for AttachState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttachState::Unattached => "Unattached",
            AttachState::AddressAcquired => "AddressAcquired",
            AttachState::TopologyWired => "TopologyWired",
            AttachState::NatInstalled => "NatInstalled",
            AttachState::Ready => "Ready",
        };
        f.write_str(name)
    }
}

/// Overlay plugin implementation
pub struct OverlayPlugin<L: Ledger = FileLedger> {
    /// Network configuration
    config: NetConf,
    /// Command arguments
    args: CmdArgs,
    allocator: IpAllocator<L>,
    host: Option<HostPrep>,
}

impl OverlayPlugin<FileLedger> {
    /// Create a plugin backed by the ledger file named in the configuration
    pub fn new(config: NetConf, args: CmdArgs) -> Self {
        let ledger = config.file_ledger();
        Self::with_ledger(config, args, ledger)
    }
}

impl<L: Ledger> OverlayPlugin<L> {
    pub fn with_ledger(config: NetConf, args: CmdArgs, ledger: L) -> Self {
        let host = config.br_netfilter.then(HostPrep::default);
        Self {
            config,
            args,
            allocator: IpAllocator::new(ledger),
            host,
        }
    }

    /// Override host preparation; `None` skips it regardless of `brNetfilter`
    pub fn with_host_prep(mut self, host: Option<HostPrep>) -> Self {
        self.host = host;
        self
    }

    pub fn config(&self) -> &NetConf {
        &self.config
    }

    pub fn allocator(&self) -> &IpAllocator<L> {
        &self.allocator
    }

    /// Who the container is, for logs: the pod from `CNI_ARGS` when the
    /// runtime passes one, the container ID otherwise
    pub fn pod_label(&self) -> String {
        let namespace = self.args.args.get("K8S_POD_NAMESPACE");
        match (namespace, self.args.args.get("K8S_POD_NAME")) {
            (Some(ns), Some(name)) => format!("{}/{}", ns, name),
            (None, Some(name)) => name.clone(),
            _ => self.args.container_id.clone(),
        }
    }

    fn advance(&self, state: &mut AttachState, next: AttachState) {
        info!(
            "Container {} ({}): {} -> {}",
            self.pod_label(),
            self.args.ifname,
            state,
            next
        );
        *state = next;
    }

    /// Add a container to the overlay
    pub async fn add_network<C, T>(&self, links: &C, nat: &mut NatRuleInstaller<T>) -> Result<CniResult>
    where
        C: LinkChannel,
        T: NftTransport,
    {
        let mut state = AttachState::Unattached;
        let result = self.run_add(links, nat, &mut state).await;
        if let Err(e) = &result {
            error!(
                "ADD for container {} failed after reaching {}: {}",
                self.pod_label(),
                state,
                e
            );
        }
        result
    }

    async fn run_add<C, T>(
        &self,
        links: &C,
        nat: &mut NatRuleInstaller<T>,
        state: &mut AttachState,
    ) -> Result<CniResult>
    where
        C: LinkChannel,
        T: NftTransport,
    {
        let node_subnet = self.config.node_subnet()?;
        let cluster_subnet = self.config.cluster_subnet()?;

        if let Some(host) = &self.host {
            host.enable_br_netfilter()?;
        }

        let container_cidr = self
            .allocator
            .acquire_container_address(&node_subnet, &cluster_subnet)?;
        let bridge_cidr = bridge_address(&node_subnet, &cluster_subnet)?;
        self.advance(state, AttachState::AddressAcquired);

        let attachment = self.attachment(container_cidr, bridge_cidr);
        let topology = TopologyBuilder::new(links, &self.config.bridge, self.config.vxlan_spec());
        let names = topology.attach_container(&attachment).await?;
        self.advance(state, AttachState::TopologyWired);

        nat.install_masquerade(&self.config.host_physical_interface, &cluster_subnet)?;
        self.advance(state, AttachState::NatInstalled);

        let mut result = CniResult::new(&self.config.cni_version);
        let container_if = result.add_interface(Interface {
            name: self.args.ifname.clone(),
            mac: None,
            sandbox: Some(self.args.netns.clone()),
        });
        result.add_interface(Interface {
            name: names.host,
            mac: None,
            sandbox: None,
        });
        result.add_ip(IPConfig {
            version: Some("4".to_string()),
            interface: Some(container_if),
            address: container_cidr.to_string(),
            gateway: Some(bridge_cidr.address().to_string()),
        });
        result.add_route(Route {
            dst: "0.0.0.0/0".to_string(),
            gw: Some(bridge_cidr.address().to_string()),
        });
        self.advance(state, AttachState::Ready);

        Ok(result)
    }

    /// Remove a container from the overlay
    pub async fn del_network<C: LinkChannel>(&self, links: &C) -> Result<()> {
        let topology = TopologyBuilder::new(links, &self.config.bridge, self.config.vxlan_spec());
        topology
            .detach_container(&self.args.netns, &self.args.ifname, &self.args.container_id)
            .await?;

        info!(
            "Container {} ({}): {} -> {}",
            self.pod_label(),
            self.args.ifname,
            AttachState::Ready,
            AttachState::Unattached
        );
        Ok(())
    }

    fn attachment(&self, container_cidr: Cidr, bridge_cidr: Cidr) -> ContainerAttachment {
        ContainerAttachment {
            netns: self.args.netns.clone(),
            ifname: self.args.ifname.clone(),
            container_id: self.args.container_id.clone(),
            container_cidr,
            bridge_cidr,
            uplink: self.config.host_physical_interface.clone(),
        }
    }
}
