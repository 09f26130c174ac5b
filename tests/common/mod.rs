// Shared fakes for the kernel-facing seams. Each test binary uses a subset.
#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sknf::cidr::Cidr;
use sknf::error::{CniError, Result};
use sknf::nat::{
    collect_acks, parse_messages, Ack, EncodedBatch, Message, NftTransport, NFTA_CHAIN_NAME,
    NFTA_CHAIN_TABLE, NFTA_RULE_CHAIN, NFTA_RULE_EXPRESSIONS, NFTA_RULE_TABLE, NFTA_TABLE_NAME,
    NFT_MSG_NEWCHAIN, NFT_MSG_NEWRULE, NFT_MSG_NEWTABLE, NFNL_MSG_BATCH_BEGIN,
    NFNL_SUBSYS_NFTABLES, NLMSG_ERROR,
};
use sknf::netns::Netns;
use sknf::topology::{LinkChannel, VxlanSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceKind {
    Physical,
    Bridge,
    Vxlan { spec: VxlanSpec, uplink: u32 },
    Veth { peer: u32 },
}

#[derive(Debug, Clone)]
pub struct Device {
    pub index: u32,
    pub name: String,
    pub kind: DeviceKind,
    /// `None` is the host namespace
    pub namespace: Option<PathBuf>,
    pub up: bool,
    pub master: Option<u32>,
    pub addresses: Vec<Cidr>,
    pub default_gateway: Option<Ipv4Addr>,
}

#[derive(Debug, Default)]
pub struct KernelState {
    next_index: u32,
    pub devices: HashMap<u32, Device>,
    /// Operation names in the order they were requested
    pub requests: Vec<String>,
    /// Operation that answers with a negative acknowledgement
    pub fail_on: Option<String>,
}

impl KernelState {
    fn host_device(&self, name: &str) -> Option<&Device> {
        self.devices
            .values()
            .find(|d| d.namespace.is_none() && d.name == name)
    }

    fn add(&mut self, name: &str, kind: DeviceKind) -> u32 {
        self.next_index += 1;
        let index = self.next_index;
        self.devices.insert(
            index,
            Device {
                index,
                name: name.to_string(),
                kind,
                namespace: None,
                up: false,
                master: None,
                addresses: Vec::new(),
                default_gateway: None,
            },
        );
        index
    }

    fn record(&mut self, op: &str) -> Result<()> {
        self.requests.push(op.to_string());
        if self.fail_on.as_deref() == Some(op) {
            return Err(CniError::kernel(
                format!("Injected failure in {}", op),
                "Operation not permitted",
            ));
        }
        Ok(())
    }

    fn device_mut(&mut self, index: u32) -> Result<&mut Device> {
        self.devices
            .get_mut(&index)
            .ok_or_else(|| CniError::kernel("Fake kernel", format!("ifindex {}: No such device", index)))
    }
}

/// In-memory stand-in for rtnetlink, starting with one physical uplink
pub struct FakeKernel {
    state: Mutex<KernelState>,
}

impl FakeKernel {
    pub fn with_uplink(name: &str) -> Self {
        let mut state = KernelState::default();
        state.add(name, DeviceKind::Physical);
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn fail_on(&self, op: &str) {
        self.state.lock().unwrap().fail_on = Some(op.to_string());
    }

    pub fn host_device(&self, name: &str) -> Option<Device> {
        self.state.lock().unwrap().host_device(name).cloned()
    }

    pub fn device_in(&self, netns: &Path, name: &str) -> Option<Device> {
        self.state
            .lock()
            .unwrap()
            .devices
            .values()
            .find(|d| d.namespace.as_deref() == Some(netns) && d.name == name)
            .cloned()
    }

    pub fn count_kind(&self, pred: impl Fn(&DeviceKind) -> bool) -> usize {
        self.state
            .lock()
            .unwrap()
            .devices
            .values()
            .filter(|d| pred(&d.kind))
            .count()
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn count_requests(&self, op: &str) -> usize {
        self.requests().iter().filter(|r| r.as_str() == op).count()
    }
}

impl LinkChannel for FakeKernel {
    async fn link_index(&self, name: &str) -> Result<Option<u32>> {
        Ok(self.state.lock().unwrap().host_device(name).map(|d| d.index))
    }

    async fn link_master(&self, index: u32) -> Result<Option<u32>> {
        let mut state = self.state.lock().unwrap();
        Ok(state.device_mut(index)?.master)
    }

    async fn create_bridge(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.record("create_bridge")?;
        if state.host_device(name).is_none() {
            state.add(name, DeviceKind::Bridge);
        }
        Ok(())
    }

    async fn create_vxlan(&self, spec: &VxlanSpec, uplink_index: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.record("create_vxlan")?;
        if state.host_device(&spec.name).is_none() {
            let kind = DeviceKind::Vxlan {
                spec: spec.clone(),
                uplink: uplink_index,
            };
            state.add(&spec.name, kind);
        }
        Ok(())
    }

    async fn create_veth(&self, name: &str, peer: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.record("create_veth")?;
        if state.host_device(name).is_some() || state.host_device(peer).is_some() {
            return Err(CniError::kernel("Failure creating veth", "File exists"));
        }
        let a = state.add(name, DeviceKind::Veth { peer: 0 });
        let b = state.add(peer, DeviceKind::Veth { peer: a });
        state.device_mut(a)?.kind = DeviceKind::Veth { peer: b };
        Ok(())
    }

    async fn move_into_namespace(&self, index: u32, netns: &Netns, new_name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.record("move_into_namespace")?;
        let device = state.device_mut(index)?;
        device.namespace = Some(netns.path().to_path_buf());
        device.name = new_name.to_string();
        device.up = true;
        Ok(())
    }

    async fn set_up(&self, index: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.record("set_up")?;
        state.device_mut(index)?.up = true;
        Ok(())
    }

    async fn set_master(&self, index: u32, master: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.record("set_master")?;
        state.device_mut(index)?.master = Some(master);
        Ok(())
    }

    async fn add_address(&self, index: u32, cidr: &Cidr) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.record("add_address")?;
        state.device_mut(index)?.addresses.push(*cidr);
        Ok(())
    }

    async fn configure_in_namespace(
        &self,
        netns: &Netns,
        ifname: &str,
        cidr: &Cidr,
        gateway: Ipv4Addr,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.record("configure_in_namespace")?;
        let device = state
            .devices
            .values_mut()
            .find(|d| d.namespace.as_deref() == Some(netns.path()) && d.name == ifname)
            .ok_or_else(|| CniError::kernel("Fake kernel", format!("{}: No such device", ifname)))?;
        device.addresses.push(*cidr);
        device.default_gateway = Some(gateway);
        Ok(())
    }

    async fn delete_link(&self, index: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.record("delete_link")?;
        let device = state
            .devices
            .remove(&index)
            .ok_or_else(|| CniError::kernel("Failure deleting link", format!("ifindex {}: No such device", index)))?;
        if let DeviceKind::Veth { peer } = device.kind {
            state.devices.remove(&peer);
        }
        Ok(())
    }
}

/// One appended rule as seen by the fake ruleset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleRecord {
    pub table: String,
    pub chain: String,
    pub expressions: Vec<String>,
}

/// In-memory nf_tables that decodes submitted batches
#[derive(Debug, Default)]
pub struct FakeNetfilter {
    pub tables: BTreeSet<String>,
    pub chains: BTreeSet<(String, String)>,
    pub rules: Vec<RuleRecord>,
    pub batches: usize,
    /// errno returned for the rule message, if set
    pub reject_rule_with: Option<i32>,
    /// errno returned for the whole batch on its begin message, if set
    pub reject_batch_with: Option<i32>,
}

/// `NLMSG_ERROR` reply carrying `error` for `seq`
fn reply(seq: u32, error: i32) -> Message {
    let mut payload = error.to_ne_bytes().to_vec();
    payload.extend_from_slice(&[0u8; 16]);
    Message {
        msg_type: NLMSG_ERROR,
        flags: 0,
        seq,
        port: 0,
        payload,
    }
}

fn str_attr(attrs: &[sknf::nat::Attr], attr_type: u16) -> String {
    attrs
        .iter()
        .find(|a| a.attr_type == attr_type)
        .and_then(|a| a.as_str())
        .unwrap_or_default()
        .to_string()
}

impl NftTransport for FakeNetfilter {
    fn exchange(&mut self, batch: &EncodedBatch) -> Result<Vec<Ack>> {
        self.batches += 1;
        let mut replies = Vec::new();

        for msg in parse_messages(&batch.bytes)? {
            if msg.msg_type == NFNL_MSG_BATCH_BEGIN {
                if let Some(errno) = self.reject_batch_with {
                    replies.push(reply(msg.seq, -errno));
                    break;
                }
                continue;
            }
            if msg.msg_type >> 8 != NFNL_SUBSYS_NFTABLES {
                continue;
            }
            let attrs = msg.nft_attrs();

            match msg.msg_type & 0xff {
                NFT_MSG_NEWTABLE => {
                    self.tables.insert(str_attr(&attrs, NFTA_TABLE_NAME));
                }
                NFT_MSG_NEWCHAIN => {
                    self.chains.insert((
                        str_attr(&attrs, NFTA_CHAIN_TABLE),
                        str_attr(&attrs, NFTA_CHAIN_NAME),
                    ));
                }
                NFT_MSG_NEWRULE => {
                    if let Some(errno) = self.reject_rule_with {
                        replies.push(reply(msg.seq, -errno));
                        break;
                    }
                    let expressions = attrs
                        .iter()
                        .find(|a| a.attr_type == NFTA_RULE_EXPRESSIONS)
                        .map(|list| {
                            list.children()
                                .iter()
                                .filter_map(|e| e.children().first().and_then(|n| n.as_str()).map(String::from))
                                .collect()
                        })
                        .unwrap_or_default();
                    self.rules.push(RuleRecord {
                        table: str_attr(&attrs, NFTA_RULE_TABLE),
                        chain: str_attr(&attrs, NFTA_RULE_CHAIN),
                        expressions,
                    });
                }
                _ => continue,
            }

            replies.push(reply(msg.seq, 0));
        }

        // decoded the same way the socket transport decodes kernel replies
        let mut pending: BTreeSet<u32> = batch.acked.iter().copied().collect();
        let mut acks = Vec::new();
        collect_acks(&replies, 0, &mut pending, &mut acks);
        Ok(acks)
    }
}

/// A regular file standing in for a namespace path
pub fn netns_placeholder(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"").unwrap();
    path
}
