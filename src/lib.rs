//! sknf CNI plugin
//!
//! Wires containers into a VXLAN overlay shared by every host in the cluster:
//! - Allocates container addresses from the node subnet
//! - Creates the host bridge and VXLAN device, and a veth pair per container
//! - Masquerades cluster traffic leaving through the physical uplink
//! - Removes the container's veth pair on deletion

pub mod cidr;
pub mod commands;
pub mod config;
pub mod error;
pub mod host;
pub mod ipam;
pub mod naming;
pub mod nat;
pub mod netns;
pub mod plugin;
pub mod rtnl;
pub mod topology;
pub mod types;

// Re-export commonly used items
pub use cidr::Cidr;
pub use commands::{cmd_add, cmd_del, run_cni};
pub use config::NetConf;
pub use error::{CniError, ErrorResponse};
pub use plugin::OverlayPlugin;
