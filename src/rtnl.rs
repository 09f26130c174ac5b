//! rtnetlink-backed [`LinkChannel`].
//!
//! One connection per namespace: the socket is bound to the namespace that was
//! active when it was opened, so configuring a device inside a container goes
//! through a second connection opened on a thread that has entered that
//! namespace.

use futures::TryStreamExt;
use netlink_packet_route::link::nlas::Nla as LinkNla;
use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::io::AsRawFd;
use tracing::debug;

use crate::cidr::Cidr;
use crate::error::{CniError, Result};
use crate::netns::Netns;
use crate::topology::{LinkChannel, VxlanSpec};

/// Connected rtnetlink handle for the namespace it was opened in
pub struct RtnlChannel {
    handle: rtnetlink::Handle,
    // Drives the socket; aborted when the channel is dropped
    conn_task: tokio::task::JoinHandle<()>,
}

impl RtnlChannel {
    /// Open a route netlink connection in the calling thread's namespace.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect() -> Result<Self> {
        let (conn, handle, _) = rtnetlink::new_connection()
            .map_err(|e| CniError::io("Error creating/connecting to netlink socket", "NETLINK_ROUTE", e))?;
        let conn_task = tokio::spawn(conn);

        Ok(Self { handle, conn_task })
    }

    /// Install `0.0.0.0/0 via gateway dev <index>`
    pub async fn add_default_route(&self, gateway: Ipv4Addr, index: u32) -> Result<()> {
        debug!("Adding default route via {} on ifindex {}", gateway, index);
        let result = self
            .handle
            .route()
            .add()
            .v4()
            .destination_prefix(Ipv4Addr::UNSPECIFIED, 0)
            .gateway(gateway)
            .output_interface(index)
            .execute()
            .await;

        tolerate_exists(result).map_err(|e| CniError::kernel("Failed to add route", e))
    }

    /// Address + default route, run on a thread that has entered `netns`
    fn configure_blocking(
        netns: &Netns,
        ifname: &str,
        cidr: Cidr,
        gateway: Ipv4Addr,
    ) -> Result<()> {
        netns.run(|| {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| CniError::io("Failed to create Tokio runtime", ifname, e))?;

            rt.block_on(async {
                let chan = RtnlChannel::connect()?;

                let index = chan.link_index(ifname).await?.ok_or_else(|| {
                    CniError::kernel(
                        "Failed to resolve ifindex for container veth",
                        format!("{}: No such device", ifname),
                    )
                })?;

                chan.add_address(index, &cidr).await?;
                chan.add_default_route(gateway, index).await
            })
        })
    }
}

impl Drop for RtnlChannel {
    fn drop(&mut self) {
        self.conn_task.abort();
    }
}

fn tolerate_exists(result: std::result::Result<(), rtnetlink::Error>) -> std::result::Result<(), rtnetlink::Error> {
    match result {
        Err(e) if e.to_string().contains("File exists") => Ok(()),
        other => other,
    }
}

impl LinkChannel for RtnlChannel {
    async fn link_index(&self, name: &str) -> Result<Option<u32>> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();

        match links.try_next().await {
            Ok(Some(msg)) => Ok(Some(msg.header.index)),
            Ok(None) => Ok(None),
            // some kernels answer a by-name lookup with ENODEV
            Err(e) if e.to_string().contains("No such device") => Ok(None),
            Err(e) => Err(CniError::kernel(
                "Failure filling rtnl_link information from kernel",
                format!("{}: {}", name, e),
            )),
        }
    }

    async fn link_master(&self, index: u32) -> Result<Option<u32>> {
        let mut links = self.handle.link().get().match_index(index).execute();

        let msg = links.try_next().await.map_err(|e| {
            CniError::kernel(
                "Failure filling rtnl_link information from kernel",
                format!("ifindex {}: {}", index, e),
            )
        })?;

        Ok(msg.and_then(|msg| {
            msg.nlas.iter().find_map(|nla| match nla {
                LinkNla::Master(master) => Some(*master),
                _ => None,
            })
        }))
    }

    async fn create_bridge(&self, name: &str) -> Result<()> {
        debug!("Creating bridge {}", name);
        let result = self
            .handle
            .link()
            .add()
            .bridge(name.to_string())
            .execute()
            .await;

        tolerate_exists(result).map_err(|e| CniError::kernel("Failure creating bridge", e))
    }

    async fn create_vxlan(&self, spec: &VxlanSpec, uplink_index: u32) -> Result<()> {
        debug!(
            "Creating vxlan {} (vni {}, group {}, port {}) on ifindex {}",
            spec.name, spec.vni, spec.group, spec.port, uplink_index
        );
        let result = self
            .handle
            .link()
            .add()
            .vxlan(spec.name.clone(), spec.vni)
            .link(uplink_index)
            .group(spec.group)
            .port(spec.port)
            .execute()
            .await;

        tolerate_exists(result).map_err(|e| CniError::kernel("Failure creating vxlan", e))
    }

    async fn create_veth(&self, name: &str, peer: &str) -> Result<()> {
        debug!("Creating veth pair {} <-> {}", name, peer);
        self.handle
            .link()
            .add()
            .veth(name.to_string(), peer.to_string())
            .execute()
            .await
            .map_err(|e| CniError::kernel("Failure creating veth", e))
    }

    async fn move_into_namespace(&self, index: u32, netns: &Netns, new_name: &str) -> Result<()> {
        debug!(
            "Moving ifindex {} into {} as {}",
            index,
            netns.path().display(),
            new_name
        );
        self.handle
            .link()
            .set(index)
            .setns_by_fd(netns.as_raw_fd())
            .name(new_name.to_string())
            .up()
            .execute()
            .await
            .map_err(|e| CniError::kernel("Failure moving veth to container network namespace", e))
    }

    async fn set_up(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|e| CniError::kernel("Failure activating link", format!("ifindex {}: {}", index, e)))
    }

    async fn set_master(&self, index: u32, master: u32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .master(master)
            .execute()
            .await
            .map_err(|e| CniError::kernel("Failure enslaving link to bridge", format!("ifindex {}: {}", index, e)))
    }

    async fn add_address(&self, index: u32, cidr: &Cidr) -> Result<()> {
        debug!("Assigning {} to ifindex {}", cidr, index);
        let result = self
            .handle
            .address()
            .add(index, IpAddr::V4(cidr.address()), cidr.prefix_len())
            .execute()
            .await;

        tolerate_exists(result).map_err(|e| CniError::kernel("Failed to assign cidr to interface", format!("{}: {}", cidr, e)))
    }

    async fn configure_in_namespace(
        &self,
        netns: &Netns,
        ifname: &str,
        cidr: &Cidr,
        gateway: Ipv4Addr,
    ) -> Result<()> {
        // setns() is per OS thread, so this never runs on a runtime worker
        let netns = netns.try_clone()?;
        let ifname = ifname.to_string();
        let cidr = *cidr;
        let (tx, rx) = tokio::sync::oneshot::channel();

        std::thread::spawn(move || {
            let result = Self::configure_blocking(&netns, &ifname, cidr, gateway);
            let _ = tx.send(result);
        });

        rx.await.map_err(|_| {
            CniError::kernel(
                "Failure configuring container's veth",
                "in-namespace thread exited without a result",
            )
        })?
    }

    async fn delete_link(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|e| CniError::kernel("Failure deleting link", format!("ifindex {}: {}", index, e)))
    }
}
