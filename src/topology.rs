//! Per-host overlay topology: one bridge, one VXLAN device enslaved to it,
//! and one veth pair per container.
//!
//! Bridge and VXLAN are shared by every container on the host and are only
//! created when missing. Veth pairs are created per container. Nothing is
//! rolled back when a step fails; the next ADD or DEL runs over whatever was
//! left behind.

use std::net::Ipv4Addr;
use tracing::{debug, info};

use crate::cidr::Cidr;
use crate::error::{CniError, Result};
use crate::naming::DeviceNames;
use crate::netns::Netns;

/// Default bridge name shared by all containers on the host
pub const DEFAULT_BRIDGE_NAME: &str = "brsknf";
/// Default VXLAN device name
pub const DEFAULT_VXLAN_NAME: &str = "vxsknf";
pub const DEFAULT_VXLAN_VNI: u32 = 100;
pub const DEFAULT_VXLAN_GROUP: Ipv4Addr = Ipv4Addr::new(239, 1, 1, 100);
/// IANA-assigned VXLAN UDP port
pub const VXLAN_UDP_PORT: u16 = 4789;

/// Kernel link/address/route configuration requests.
///
/// Every call applies to the namespace the channel was opened in, except
/// [`LinkChannel::configure_in_namespace`], which switches into the given
/// namespace for the duration of the call.
#[allow(async_fn_in_trait)]
pub trait LinkChannel {
    /// Index of the device called `name`, or `None` if there is none
    async fn link_index(&self, name: &str) -> Result<Option<u32>>;

    /// Index of the bridge the device is enslaved to, if any
    async fn link_master(&self, index: u32) -> Result<Option<u32>>;

    async fn create_bridge(&self, name: &str) -> Result<()>;

    async fn create_vxlan(&self, spec: &VxlanSpec, uplink_index: u32) -> Result<()>;

    /// Create a veth pair with both ends in the channel's namespace
    async fn create_veth(&self, name: &str, peer: &str) -> Result<()>;

    /// Move a device into `netns`, rename it and bring it up in one request
    async fn move_into_namespace(&self, index: u32, netns: &Netns, new_name: &str) -> Result<()>;

    async fn set_up(&self, index: u32) -> Result<()>;

    async fn set_master(&self, index: u32, master: u32) -> Result<()>;

    async fn add_address(&self, index: u32, cidr: &Cidr) -> Result<()>;

    /// Inside `netns`: assign `cidr` to `ifname` and route `0.0.0.0/0` via `gateway`
    async fn configure_in_namespace(
        &self,
        netns: &Netns,
        ifname: &str,
        cidr: &Cidr,
        gateway: Ipv4Addr,
    ) -> Result<()>;

    /// Delete a device. Deleting one end of a veth pair removes its peer.
    async fn delete_link(&self, index: u32) -> Result<()>;
}

/// VXLAN overlay device settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VxlanSpec {
    pub name: String,
    pub vni: u32,
    pub group: Ipv4Addr,
    pub port: u16,
}

impl Default for VxlanSpec {
    fn default() -> Self {
        Self {
            name: DEFAULT_VXLAN_NAME.to_string(),
            vni: DEFAULT_VXLAN_VNI,
            group: DEFAULT_VXLAN_GROUP,
            port: VXLAN_UDP_PORT,
        }
    }
}

/// Identifies one container attachment and the addresses it gets
#[derive(Debug, Clone)]
pub struct ContainerAttachment {
    /// Path of the container's network namespace
    pub netns: String,
    /// Interface name inside the container
    pub ifname: String,
    pub container_id: String,
    pub container_cidr: Cidr,
    pub bridge_cidr: Cidr,
    /// Physical interface the VXLAN device rides on
    pub uplink: String,
}

impl ContainerAttachment {
    pub fn device_names(&self) -> DeviceNames {
        DeviceNames::derive(&self.netns, &self.ifname, &self.container_id)
    }
}

/// Builds and tears down the topology over an already connected channel
pub struct TopologyBuilder<'a, C: LinkChannel> {
    chan: &'a C,
    bridge: String,
    vxlan: VxlanSpec,
}

impl<'a, C: LinkChannel> TopologyBuilder<'a, C> {
    pub fn new(chan: &'a C, bridge: impl Into<String>, vxlan: VxlanSpec) -> Self {
        Self {
            chan,
            bridge: bridge.into(),
            vxlan,
        }
    }

    pub fn bridge_name(&self) -> &str {
        &self.bridge
    }

    pub fn vxlan(&self) -> &VxlanSpec {
        &self.vxlan
    }

    async fn require_index(&self, name: &str, context: &str) -> Result<u32> {
        self.chan
            .link_index(name)
            .await?
            .ok_or_else(|| CniError::kernel(context, format!("{}: No such device", name)))
    }

    /// Create the bridge, bring it up and give it `bridge_cidr`.
    /// Does nothing if a device with that name already exists.
    pub async fn ensure_bridge(&self, bridge_cidr: &Cidr) -> Result<()> {
        if let Some(index) = self.chan.link_index(&self.bridge).await? {
            debug!("Bridge already exists (ifidx={}; name={})", index, self.bridge);
            return Ok(());
        }

        self.chan.create_bridge(&self.bridge).await?;
        let index = self
            .require_index(&self.bridge, "Failed to resolve ifindex for bridge")
            .await?;
        self.chan.set_up(index).await?;
        self.chan.add_address(index, bridge_cidr).await?;

        info!("Created bridge {} with address {}", self.bridge, bridge_cidr);
        Ok(())
    }

    /// Create the VXLAN device on top of `uplink` and bring it up.
    /// Does nothing if a device with that name already exists.
    pub async fn ensure_vxlan(&self, uplink: &str) -> Result<()> {
        if let Some(index) = self.chan.link_index(&self.vxlan.name).await? {
            debug!("Vxlan already exists (ifidx={}; name={})", index, self.vxlan.name);
            return Ok(());
        }

        let uplink_index = self
            .require_index(uplink, "Failed to resolve ifindex for uplink")
            .await?;
        self.chan.create_vxlan(&self.vxlan, uplink_index).await?;
        let index = self
            .require_index(&self.vxlan.name, "Failed to resolve ifindex for vxlan")
            .await?;
        self.chan.set_up(index).await?;

        info!(
            "Created vxlan {} (vni {}) on {}",
            self.vxlan.name, self.vxlan.vni, uplink
        );
        Ok(())
    }

    /// Create `(host_side, transient)` in the host namespace, then move the
    /// transient end into `netns` renamed to `container_side` and up.
    pub async fn create_veth_into_namespace(
        &self,
        netns: &Netns,
        container_side: &str,
        transient: &str,
        host_side: &str,
    ) -> Result<()> {
        self.chan.create_veth(host_side, transient).await?;

        let peer = self
            .require_index(transient, "Failed to resolve ifindex for transient veth")
            .await?;
        self.chan
            .move_into_namespace(peer, netns, container_side)
            .await?;

        info!(
            "Created veth {} and moved peer into {} as {}",
            host_side,
            netns.path().display(),
            container_side
        );
        Ok(())
    }

    /// Address the container end and route its default traffic via the bridge
    pub async fn configure_container_side(
        &self,
        netns: &Netns,
        container_side: &str,
        container_cidr: &Cidr,
        bridge_cidr: &Cidr,
    ) -> Result<()> {
        self.chan
            .configure_in_namespace(netns, container_side, container_cidr, bridge_cidr.address())
            .await?;

        info!(
            "Configured {} in {} with {} via {}",
            container_side,
            netns.path().display(),
            container_cidr,
            bridge_cidr.address()
        );
        Ok(())
    }

    /// Bring `name` up and enslave it to the bridge
    pub async fn enable_and_enslave(&self, name: &str) -> Result<()> {
        let index = self
            .require_index(name, "Failure filling rtnl_link information from kernel")
            .await?;
        self.chan.set_up(index).await?;
        self.enslave(index, name).await
    }

    /// Enslave the VXLAN device to the bridge if it is not already
    pub async fn enslave_vxlan(&self) -> Result<()> {
        let index = self
            .require_index(&self.vxlan.name, "Failure filling vxlan information from kernel")
            .await?;
        self.enslave(index, &self.vxlan.name).await
    }

    async fn enslave(&self, index: u32, name: &str) -> Result<()> {
        let bridge = self
            .require_index(&self.bridge, "Failure filling bridge information from kernel")
            .await?;

        if self.chan.link_master(index).await? == Some(bridge) {
            debug!("{} already enslaved to {}", name, self.bridge);
            return Ok(());
        }

        self.chan.set_master(index, bridge).await?;
        debug!("Enslaved {} to {}", name, self.bridge);
        Ok(())
    }

    /// Wire a container into the overlay. Success means the container is routable.
    pub async fn attach_container(&self, attachment: &ContainerAttachment) -> Result<DeviceNames> {
        let names = attachment.device_names();
        let netns = Netns::open(&attachment.netns)?;

        self.ensure_bridge(&attachment.bridge_cidr).await?;
        self.ensure_vxlan(&attachment.uplink).await?;
        self.create_veth_into_namespace(&netns, &attachment.ifname, &names.transient, &names.host)
            .await?;
        self.configure_container_side(
            &netns,
            &attachment.ifname,
            &attachment.container_cidr,
            &attachment.bridge_cidr,
        )
        .await?;
        self.enable_and_enslave(&names.host).await?;
        self.enslave_vxlan().await?;

        Ok(names)
    }

    /// Delete the host end of the container's veth pair.
    ///
    /// The container end goes with it wherever it lives, so the container
    /// namespace is never entered and may already be gone. A missing device
    /// is reported, not ignored.
    pub async fn detach_container(&self, netns: &str, ifname: &str, container_id: &str) -> Result<()> {
        let names = DeviceNames::derive(netns, ifname, container_id);

        let index = self.chan.link_index(&names.host).await?.ok_or_else(|| {
            CniError::kernel(
                "Failure deleting veth pair",
                format!("{}: No such device", names.host),
            )
        })?;
        self.chan.delete_link(index).await?;

        info!("Deleted veth pair {}", names.host);
        Ok(())
    }
}
