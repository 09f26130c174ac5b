//! Deterministic host-side device names.
//!
//! Names are a pure function of the namespace path, the interface name inside
//! the container and the container id, so DEL recomputes exactly what ADD
//! created without any stored mapping.

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// Prefix of the permanent host-side veth name
pub const HOST_VETH_PREFIX: &str = "sknf";
/// Prefix of the peer's name before it is moved into the container
pub const TRANSIENT_VETH_PREFIX: &str = "tmp";

/// Kernel limit on interface names, excluding the NUL terminator
pub const IFNAME_MAX_LEN: usize = 15;

/// 32-bit FNV-1a
pub fn fnv1a32(input: &str) -> u32 {
    input.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Host-side names derived for one container attachment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNames {
    /// Host end of the veth pair, enslaved to the bridge
    pub host: String,
    /// Peer end's name while it still lives in the host namespace
    pub transient: String,
}

impl DeviceNames {
    pub fn derive(netns: &str, ifname: &str, container_id: &str) -> Self {
        let hash = attachment_hash(netns, ifname, container_id);
        Self {
            host: format!("{}{:08x}", HOST_VETH_PREFIX, hash),
            transient: format!("{}{:08x}", TRANSIENT_VETH_PREFIX, hash),
        }
    }
}

fn attachment_hash(netns: &str, ifname: &str, container_id: &str) -> u32 {
    FNV_OFFSET_BASIS ^ fnv1a32(netns) ^ fnv1a32(ifname) ^ fnv1a32(container_id)
}
