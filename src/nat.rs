//! Outbound masquerade through nf_tables.
//!
//! Equivalent of `ip saddr <cluster cidr> oifname <uplink> masquerade` in a
//! `nat` chain hooked at postrouting. The table, the chain and the rule go to
//! the kernel as one nfnetlink batch: table and chain creation merge with what
//! is already there, the rule is appended every time.
//!
//! Messages are encoded by hand against the nfnetlink ABI: `nlmsghdr` in host
//! byte order, followed by `nfgenmsg` and 4-byte aligned attributes whose
//! integer payloads are big-endian.

use netlink_sys::{protocols::NETLINK_NETFILTER, Socket};
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::cidr::Cidr;
use crate::error::{CniError, Result};

pub const NAT_TABLE_NAME: &str = "sknf";
pub const NAT_CHAIN_NAME: &str = "POSTROUTING";

const NLMSG_HDRLEN: usize = 16;
const NFGENMSG_LEN: usize = 4;
const NLA_HDRLEN: usize = 4;

pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;

pub const NLM_F_REQUEST: u16 = 0x001;
pub const NLM_F_ACK: u16 = 0x004;
pub const NLM_F_CREATE: u16 = 0x400;
pub const NLM_F_APPEND: u16 = 0x800;
pub const NLA_F_NESTED: u16 = 0x8000;
const NLA_TYPE_MASK: u16 = !(NLA_F_NESTED | 0x4000);

const NFNETLINK_V0: u8 = 0;
const AF_UNSPEC: u8 = 0;
pub const NFPROTO_IPV4: u8 = 2;

pub const NFNL_SUBSYS_NFTABLES: u16 = 10;
pub const NFNL_MSG_BATCH_BEGIN: u16 = 0x10;
pub const NFNL_MSG_BATCH_END: u16 = 0x11;

pub const NFT_MSG_NEWTABLE: u16 = 0;
pub const NFT_MSG_NEWCHAIN: u16 = 3;
pub const NFT_MSG_NEWRULE: u16 = 6;

pub const NFTA_TABLE_NAME: u16 = 1;

pub const NFTA_CHAIN_TABLE: u16 = 1;
pub const NFTA_CHAIN_NAME: u16 = 3;
pub const NFTA_CHAIN_HOOK: u16 = 4;
pub const NFTA_CHAIN_TYPE: u16 = 7;
pub const NFTA_HOOK_HOOKNUM: u16 = 1;
pub const NFTA_HOOK_PRIORITY: u16 = 2;

pub const NFTA_RULE_TABLE: u16 = 1;
pub const NFTA_RULE_CHAIN: u16 = 2;
pub const NFTA_RULE_EXPRESSIONS: u16 = 4;
pub const NFTA_LIST_ELEM: u16 = 1;
pub const NFTA_EXPR_NAME: u16 = 1;
pub const NFTA_EXPR_DATA: u16 = 2;
pub const NFTA_DATA_VALUE: u16 = 1;

const NFTA_META_DREG: u16 = 1;
const NFTA_META_KEY: u16 = 2;
const NFTA_CMP_SREG: u16 = 1;
const NFTA_CMP_OP: u16 = 2;
const NFTA_CMP_DATA: u16 = 3;
const NFTA_PAYLOAD_DREG: u16 = 1;
const NFTA_PAYLOAD_BASE: u16 = 2;
const NFTA_PAYLOAD_OFFSET: u16 = 3;
const NFTA_PAYLOAD_LEN: u16 = 4;
const NFTA_BITWISE_SREG: u16 = 1;
const NFTA_BITWISE_DREG: u16 = 2;
const NFTA_BITWISE_LEN: u16 = 3;
const NFTA_BITWISE_MASK: u16 = 4;
const NFTA_BITWISE_XOR: u16 = 5;

pub const NF_INET_POST_ROUTING: u32 = 4;
pub const NF_IP_PRI_NAT_SRC: i32 = 100;
const NFT_REG_1: u32 = 1;
const NFT_META_OIFNAME: u32 = 7;
const NFT_CMP_EQ: u32 = 0;
const NFT_PAYLOAD_NETWORK_HEADER: u32 = 1;
// offset of the source address in the IPv4 header
const IPV4_SADDR_OFFSET: u32 = 12;

fn nft_msg_type(msg: u16) -> u16 {
    (NFNL_SUBSYS_NFTABLES << 8) | msg
}

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Append-only netlink message writer
#[derive(Debug, Default)]
struct MessageWriter {
    buf: Vec<u8>,
    nests: Vec<usize>,
}

impl MessageWriter {
    /// Start a message: `nlmsghdr` with a length to be patched, then `nfgenmsg`
    fn begin(&mut self, msg_type: u16, flags: u16, seq: u32, family: u8, res_id: u16) -> usize {
        let start = self.buf.len();
        self.buf.extend_from_slice(&0u32.to_ne_bytes());
        self.buf.extend_from_slice(&msg_type.to_ne_bytes());
        self.buf.extend_from_slice(&flags.to_ne_bytes());
        self.buf.extend_from_slice(&seq.to_ne_bytes());
        self.buf.extend_from_slice(&0u32.to_ne_bytes());

        self.buf.push(family);
        self.buf.push(NFNETLINK_V0);
        self.buf.extend_from_slice(&res_id.to_be_bytes());
        start
    }

    fn finish(&mut self, start: usize) {
        let len = (self.buf.len() - start) as u32;
        self.buf[start..start + 4].copy_from_slice(&len.to_ne_bytes());
    }

    fn attr(&mut self, attr_type: u16, data: &[u8]) {
        let len = (NLA_HDRLEN + data.len()) as u16;
        self.buf.extend_from_slice(&len.to_ne_bytes());
        self.buf.extend_from_slice(&attr_type.to_ne_bytes());
        self.buf.extend_from_slice(data);
        self.pad();
    }

    fn attr_str(&mut self, attr_type: u16, value: &str) {
        let mut data = value.as_bytes().to_vec();
        data.push(0);
        self.attr(attr_type, &data);
    }

    fn attr_u32(&mut self, attr_type: u16, value: u32) {
        self.attr(attr_type, &value.to_be_bytes());
    }

    fn nest_start(&mut self, attr_type: u16) {
        self.nests.push(self.buf.len());
        self.buf.extend_from_slice(&0u16.to_ne_bytes());
        self.buf.extend_from_slice(&(attr_type | NLA_F_NESTED).to_ne_bytes());
    }

    fn nest_end(&mut self) {
        if let Some(start) = self.nests.pop() {
            let len = (self.buf.len() - start) as u16;
            self.buf[start..start + 2].copy_from_slice(&len.to_ne_bytes());
        }
    }

    /// Wrapped in `NFTA_*_DATA`/`NFTA_DATA_VALUE`, as cmp and bitwise expect
    fn attr_data_value(&mut self, attr_type: u16, value: &[u8]) {
        self.nest_start(attr_type);
        self.attr(NFTA_DATA_VALUE, value);
        self.nest_end();
    }

    fn pad(&mut self) {
        let padded = align4(self.buf.len());
        self.buf.resize(padded, 0);
    }
}

/// One expression of a rule, written as an `NFTA_LIST_ELEM`
fn expression(w: &mut MessageWriter, name: &str, body: impl FnOnce(&mut MessageWriter)) {
    w.nest_start(NFTA_LIST_ELEM);
    w.attr_str(NFTA_EXPR_NAME, name);
    w.nest_start(NFTA_EXPR_DATA);
    body(w);
    w.nest_end();
    w.nest_end();
}

/// An encoded batch and the sequence numbers that expect an acknowledgement
#[derive(Debug, Clone)]
pub struct EncodedBatch {
    pub bytes: Vec<u8>,
    pub acked: Vec<u32>,
}

/// Encode begin / NEWTABLE / NEWCHAIN / NEWRULE / end starting at `first_seq`
pub fn encode_masquerade_batch(
    table: &str,
    chain: &str,
    uplink: &str,
    cluster: &Cidr,
    first_seq: u32,
) -> EncodedBatch {
    let mut w = MessageWriter::default();
    let mut seq = first_seq;
    let mut acked = Vec::with_capacity(3);
    let create = NLM_F_REQUEST | NLM_F_CREATE | NLM_F_ACK;

    let start = w.begin(NFNL_MSG_BATCH_BEGIN, NLM_F_REQUEST, seq, AF_UNSPEC, NFNL_SUBSYS_NFTABLES);
    w.finish(start);

    // table sknf
    seq += 1;
    let start = w.begin(nft_msg_type(NFT_MSG_NEWTABLE), create, seq, NFPROTO_IPV4, 0);
    w.attr_str(NFTA_TABLE_NAME, table);
    w.finish(start);
    acked.push(seq);

    // chain POSTROUTING { type nat hook postrouting priority srcnat; }
    seq += 1;
    let start = w.begin(nft_msg_type(NFT_MSG_NEWCHAIN), create, seq, NFPROTO_IPV4, 0);
    w.attr_str(NFTA_CHAIN_TABLE, table);
    w.attr_str(NFTA_CHAIN_NAME, chain);
    w.nest_start(NFTA_CHAIN_HOOK);
    w.attr_u32(NFTA_HOOK_HOOKNUM, NF_INET_POST_ROUTING);
    w.attr_u32(NFTA_HOOK_PRIORITY, NF_IP_PRI_NAT_SRC as u32);
    w.nest_end();
    w.attr_str(NFTA_CHAIN_TYPE, "nat");
    w.finish(start);
    acked.push(seq);

    // oifname "<uplink>" ip saddr & mask == network masquerade
    seq += 1;
    let mask = u32::from(cluster.mask()).to_be_bytes();
    let network = u32::from(cluster.network()).to_be_bytes();
    let mut oifname = uplink.as_bytes().to_vec();
    oifname.push(0);

    let start = w.begin(
        nft_msg_type(NFT_MSG_NEWRULE),
        create | NLM_F_APPEND,
        seq,
        NFPROTO_IPV4,
        0,
    );
    w.attr_str(NFTA_RULE_TABLE, table);
    w.attr_str(NFTA_RULE_CHAIN, chain);
    w.nest_start(NFTA_RULE_EXPRESSIONS);
    expression(&mut w, "meta", |w| {
        w.attr_u32(NFTA_META_KEY, NFT_META_OIFNAME);
        w.attr_u32(NFTA_META_DREG, NFT_REG_1);
    });
    expression(&mut w, "cmp", |w| {
        w.attr_u32(NFTA_CMP_SREG, NFT_REG_1);
        w.attr_u32(NFTA_CMP_OP, NFT_CMP_EQ);
        w.attr_data_value(NFTA_CMP_DATA, &oifname);
    });
    expression(&mut w, "payload", |w| {
        w.attr_u32(NFTA_PAYLOAD_DREG, NFT_REG_1);
        w.attr_u32(NFTA_PAYLOAD_BASE, NFT_PAYLOAD_NETWORK_HEADER);
        w.attr_u32(NFTA_PAYLOAD_OFFSET, IPV4_SADDR_OFFSET);
        w.attr_u32(NFTA_PAYLOAD_LEN, 4);
    });
    expression(&mut w, "bitwise", |w| {
        w.attr_u32(NFTA_BITWISE_SREG, NFT_REG_1);
        w.attr_u32(NFTA_BITWISE_DREG, NFT_REG_1);
        w.attr_u32(NFTA_BITWISE_LEN, 4);
        w.attr_data_value(NFTA_BITWISE_MASK, &mask);
        w.attr_data_value(NFTA_BITWISE_XOR, &[0u8; 4]);
    });
    expression(&mut w, "cmp", |w| {
        w.attr_u32(NFTA_CMP_SREG, NFT_REG_1);
        w.attr_u32(NFTA_CMP_OP, NFT_CMP_EQ);
        w.attr_data_value(NFTA_CMP_DATA, &network);
    });
    expression(&mut w, "masq", |_| {});
    w.nest_end();
    w.finish(start);
    acked.push(seq);

    seq += 1;
    let start = w.begin(NFNL_MSG_BATCH_END, NLM_F_REQUEST, seq, AF_UNSPEC, NFNL_SUBSYS_NFTABLES);
    w.finish(start);

    EncodedBatch { bytes: w.buf, acked }
}

/// A decoded netlink message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: u16,
    pub flags: u16,
    pub seq: u32,
    pub port: u32,
    /// Everything after the `nlmsghdr`
    pub payload: Vec<u8>,
}

impl Message {
    /// Attributes following the `nfgenmsg` of an nf_tables message
    pub fn nft_attrs(&self) -> Vec<Attr> {
        self.payload
            .get(NFGENMSG_LEN..)
            .map(parse_attrs)
            .unwrap_or_default()
    }

    /// Error code of an `NLMSG_ERROR` message; zero is a plain acknowledgement
    pub fn error_code(&self) -> Option<i32> {
        if self.msg_type != NLMSG_ERROR {
            return None;
        }
        let raw: [u8; 4] = self.payload.get(..4)?.try_into().ok()?;
        Some(i32::from_ne_bytes(raw))
    }
}

/// A decoded netlink attribute, type without the nested/byte-order flags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub attr_type: u16,
    pub nested: bool,
    pub data: Vec<u8>,
}

impl Attr {
    pub fn children(&self) -> Vec<Attr> {
        parse_attrs(&self.data)
    }

    /// NUL-terminated string payload
    pub fn as_str(&self) -> Option<&str> {
        let bytes = self.data.strip_suffix(&[0]).unwrap_or(&self.data);
        std::str::from_utf8(bytes).ok()
    }

    pub fn as_u32_be(&self) -> Option<u32> {
        let raw: [u8; 4] = self.data.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(raw))
    }
}

/// Split a buffer into netlink messages
pub fn parse_messages(buf: &[u8]) -> Result<Vec<Message>> {
    let mut messages = Vec::new();
    let mut offset = 0;

    while offset + NLMSG_HDRLEN <= buf.len() {
        let header = &buf[offset..offset + NLMSG_HDRLEN];
        let len = u32::from_ne_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len < NLMSG_HDRLEN || offset + len > buf.len() {
            return Err(CniError::kernel(
                "Malformed netlink message",
                format!("length {} at offset {}", len, offset),
            ));
        }

        messages.push(Message {
            msg_type: u16::from_ne_bytes([header[4], header[5]]),
            flags: u16::from_ne_bytes([header[6], header[7]]),
            seq: u32::from_ne_bytes([header[8], header[9], header[10], header[11]]),
            port: u32::from_ne_bytes([header[12], header[13], header[14], header[15]]),
            payload: buf[offset + NLMSG_HDRLEN..offset + len].to_vec(),
        });
        offset += align4(len);
    }

    Ok(messages)
}

/// Split an attribute stream; stops at the first truncated attribute
pub fn parse_attrs(buf: &[u8]) -> Vec<Attr> {
    let mut attrs = Vec::new();
    let mut offset = 0;

    while offset + NLA_HDRLEN <= buf.len() {
        let len = u16::from_ne_bytes([buf[offset], buf[offset + 1]]) as usize;
        let raw_type = u16::from_ne_bytes([buf[offset + 2], buf[offset + 3]]);
        if len < NLA_HDRLEN || offset + len > buf.len() {
            break;
        }

        attrs.push(Attr {
            attr_type: raw_type & NLA_TYPE_MASK,
            nested: raw_type & NLA_F_NESTED != 0,
            data: buf[offset + NLA_HDRLEN..offset + len].to_vec(),
        });
        offset += align4(len);
    }

    attrs
}

/// Acknowledgement for one sequence number of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub seq: u32,
    /// Zero on success, negative errno otherwise
    pub error: i32,
}

/// Channel to the packet-filtering subsystem
pub trait NftTransport {
    /// Send the batch and collect acknowledgements until every entry of
    /// `batch.acked` is answered or an error comes back.
    fn exchange(&mut self, batch: &EncodedBatch) -> Result<Vec<Ack>>;
}

/// `NETLINK_NETFILTER` socket
pub struct NetfilterSocket {
    socket: Socket,
    port: u32,
}

impl NetfilterSocket {
    pub fn open() -> Result<Self> {
        let mut socket = Socket::new(NETLINK_NETFILTER)
            .map_err(|e| CniError::io("Failure opening mnl_socket", "NETLINK_NETFILTER", e))?;
        let addr = socket
            .bind_auto()
            .map_err(|e| CniError::io("Failure binding to mnl_socket", "NETLINK_NETFILTER", e))?;

        Ok(Self {
            socket,
            port: addr.port_number(),
        })
    }
}

impl NftTransport for NetfilterSocket {
    fn exchange(&mut self, batch: &EncodedBatch) -> Result<Vec<Ack>> {
        self.socket.send(&batch.bytes, 0).map_err(|e| {
            CniError::io(
                "Failure sending batch to configure nftables",
                "NETLINK_NETFILTER",
                e,
            )
        })?;

        let mut pending: BTreeSet<u32> = batch.acked.iter().copied().collect();
        let mut acks = Vec::new();
        let mut buf = vec![0u8; 8192];

        loop {
            let n = self.socket.recv(&mut &mut buf[..], 0).map_err(|e| {
                CniError::io(
                    "Received error when consuming nft acks",
                    "NETLINK_NETFILTER",
                    e,
                )
            })?;

            let messages = parse_messages(&buf[..n])?;
            if collect_acks(&messages, self.port, &mut pending, &mut acks) {
                return Ok(acks);
            }
        }
    }
}

/// Fold one receive buffer into `acks`.
///
/// A negative acknowledgement is kept whatever its sequence number: the
/// kernel refuses a whole batch (no CAP_NET_ADMIN, no nf_tables) on the
/// batch-begin message, which never asks for an ack. Returns `true` once
/// nothing more is expected.
pub fn collect_acks(
    messages: &[Message],
    port: u32,
    pending: &mut BTreeSet<u32>,
    acks: &mut Vec<Ack>,
) -> bool {
    for msg in messages {
        if msg.port != 0 && msg.port != port {
            continue;
        }
        if msg.msg_type == NLMSG_DONE {
            pending.clear();
            continue;
        }
        let Some(error) = msg.error_code() else {
            continue;
        };

        let expected = pending.remove(&msg.seq);
        if error != 0 {
            acks.push(Ack { seq: msg.seq, error });
            return true;
        }
        if expected {
            acks.push(Ack { seq: msg.seq, error });
        }
    }

    pending.is_empty()
}

/// Transport opened on first use, so nothing touches netfilter before a
/// batch is actually ready to go out.
pub struct LazyTransport<T, F>
where
    F: FnMut() -> Result<T>,
{
    open: F,
    transport: Option<T>,
}

impl<T, F> LazyTransport<T, F>
where
    F: FnMut() -> Result<T>,
{
    pub fn new(open: F) -> Self {
        Self {
            open,
            transport: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }
}

impl<T, F> NftTransport for LazyTransport<T, F>
where
    T: NftTransport,
    F: FnMut() -> Result<T>,
{
    fn exchange(&mut self, batch: &EncodedBatch) -> Result<Vec<Ack>> {
        if let Some(transport) = self.transport.as_mut() {
            return transport.exchange(batch);
        }
        debug!("Opening netfilter transport");
        let transport = self.transport.insert((self.open)()?);
        transport.exchange(batch)
    }
}

fn errno_reason(error: i32) -> String {
    nix::errno::Errno::from_i32(-error).desc().to_string()
}

/// Submits the masquerade batch over a transport
pub struct NatRuleInstaller<T: NftTransport> {
    transport: T,
    table: String,
    chain: String,
}

impl<T: NftTransport> NatRuleInstaller<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            table: NAT_TABLE_NAME.to_string(),
            chain: NAT_CHAIN_NAME.to_string(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Masquerade traffic from `cluster` leaving through `uplink`.
    ///
    /// The rule is appended on every call, so repeating a call leaves
    /// duplicate rules behind.
    pub fn install_masquerade(&mut self, uplink: &str, cluster: &Cidr) -> Result<()> {
        let batch = encode_masquerade_batch(&self.table, &self.chain, uplink, cluster, 1);
        debug!(
            "Submitting nftables batch ({} bytes, {} acked messages)",
            batch.bytes.len(),
            batch.acked.len()
        );

        let acks = self.transport.exchange(&batch)?;

        if let Some(rejected) = acks.iter().find(|ack| ack.error != 0) {
            return Err(CniError::kernel(
                "Failure configuring nftables",
                format!("seq {}: {}", rejected.seq, errno_reason(rejected.error)),
            ));
        }
        if acks.len() < batch.acked.len() {
            return Err(CniError::kernel(
                "Failure configuring nftables",
                format!("{} of {} messages acknowledged", acks.len(), batch.acked.len()),
            ));
        }

        info!(
            "Installed masquerade for {} via {} in {}/{}",
            cluster, uplink, self.table, self.chain
        );
        Ok(())
    }
}

/// Open a netfilter socket and install the masquerade rule
pub fn install_masquerade(uplink: &str, cluster: &Cidr) -> Result<()> {
    NatRuleInstaller::new(NetfilterSocket::open()?).install_masquerade(uplink, cluster)
}
