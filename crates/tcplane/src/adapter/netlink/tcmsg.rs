//! TC message header, attribute ids and qdisc/classifier wire structs.
//!
//! Mirrors the kernel's `linux/pkt_sched.h` and `linux/pkt_cls.h` layouts.
//! All structs are `repr(C)` with explicit padding so zerocopy can hand
//! them to the message builder byte-for-byte.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// TC message header (mirrors `struct tcmsg`, 20 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TcMsg {
    /// Address family (AF_UNSPEC).
    pub tcm_family: u8,
    pub tcm_pad1: u8,
    pub tcm_pad2: u16,
    /// Interface index.
    pub tcm_ifindex: i32,
    /// Qdisc/class/filter handle.
    pub tcm_handle: u32,
    /// Parent handle.
    pub tcm_parent: u32,
    /// For filters: priority in the upper 16 bits, protocol (network
    /// order) in the lower 16.
    pub tcm_info: u32,
}

/// Size of the TC message header.
pub const TCMSG_LEN: usize = std::mem::size_of::<TcMsg>();

impl TcMsg {
    /// An empty header.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the interface index.
    pub fn with_ifindex(mut self, ifindex: i32) -> Self {
        self.tcm_ifindex = ifindex;
        self
    }

    /// Set the object handle.
    pub fn with_handle(mut self, handle: u32) -> Self {
        self.tcm_handle = handle;
        self
    }

    /// Set the parent handle.
    pub fn with_parent(mut self, parent: u32) -> Self {
        self.tcm_parent = parent;
        self
    }

    /// Set the info word (filters: priority/protocol).
    pub fn with_info(mut self, info: u32) -> Self {
        self.tcm_info = info;
        self
    }

    /// Parse from the front of a message payload.
    pub fn from_bytes(data: &[u8]) -> Option<&Self> {
        Self::ref_from_prefix(data).ok().map(|(msg, _)| msg)
    }
}

/// Well-known parent handles.
pub mod tc_handle {
    /// Attach at the device root.
    pub const ROOT: u32 = 0xFFFF_FFFF;
}

/// Pack a filter's `tcm_info`: priority in the major half, the link
/// protocol's ethertype in network order in the minor half.
pub const fn filter_info(priority: u16, ethertype: u16) -> u32 {
    ((priority as u32) << 16) | (ethertype.to_be() as u32)
}

/// Unpack the priority from a filter's `tcm_info`.
pub const fn filter_priority(info: u32) -> u16 {
    (info >> 16) as u16
}

// Top-level TCA_* attributes.
pub const TCA_KIND: u16 = 1;
pub const TCA_OPTIONS: u16 = 2;
pub const TCA_STATS: u16 = 3;
pub const TCA_STATS2: u16 = 7;

// Nested inside TCA_STATS2.
pub const TCA_STATS_BASIC: u16 = 1;
pub const TCA_STATS_QUEUE: u16 = 3;
pub const TCA_STATS_PKT64: u16 = 8;

/// Rate descriptor (mirrors `struct tc_ratespec`, 12 bytes). `rate` is in
/// bytes per second, capped at `u32::MAX`; wider rates ride in the
/// RATE64/CEIL64 attributes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TcRateSpec {
    pub cell_log: u8,
    pub linklayer: u8,
    pub overhead: u16,
    pub cell_align: i16,
    pub mpu: u16,
    /// Bytes per second.
    pub rate: u32,
}

impl TcRateSpec {
    /// A rate descriptor for `bytes_per_second`, saturating at 32 bits.
    pub fn from_bytes_per_second(bytes_per_second: u64) -> Self {
        Self {
            rate: u32::try_from(bytes_per_second).unwrap_or(u32::MAX),
            ..Default::default()
        }
    }
}

// HTB.
pub const TCA_HTB_PARMS: u16 = 1;
pub const TCA_HTB_INIT: u16 = 2;
pub const TCA_HTB_CTAB: u16 = 3;
pub const TCA_HTB_RTAB: u16 = 4;
pub const TCA_HTB_RATE64: u16 = 6;
pub const TCA_HTB_CEIL64: u16 = 7;

/// HTB protocol version expected by the kernel.
pub const TC_HTB_PROTOVER: u32 = 3;

/// HTB qdisc global options (mirrors `struct tc_htb_glob`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TcHtbGlob {
    pub version: u32,
    pub rate2quantum: u32,
    pub defcls: u32,
    pub debug: u32,
    pub direct_pkts: u32,
}

/// HTB class options (mirrors `struct tc_htb_opt`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TcHtbOpt {
    pub rate: TcRateSpec,
    pub ceil: TcRateSpec,
    /// Rate token buffer, in ticks.
    pub buffer: u32,
    /// Ceil token buffer, in ticks.
    pub cbuffer: u32,
    pub quantum: u32,
    pub level: u32,
    pub prio: u32,
}

// TBF.
pub const TCA_TBF_PARMS: u16 = 1;
pub const TCA_TBF_RTAB: u16 = 2;
pub const TCA_TBF_BURST: u16 = 6;

/// TBF qdisc options (mirrors `struct tc_tbf_qopt`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TcTbfQopt {
    pub rate: TcRateSpec,
    pub peakrate: TcRateSpec,
    /// Queue limit in bytes.
    pub limit: u32,
    /// Token buffer, in ticks.
    pub buffer: u32,
    pub mtu: u32,
}

/// PRIO qdisc options (mirrors `struct tc_prio_qopt`). Sent as the raw
/// TCA_OPTIONS payload, not nested attributes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TcPrioQopt {
    pub bands: i32,
    pub priomap: [u8; 16],
}

// FQ_CODEL.
pub const TCA_FQ_CODEL_TARGET: u16 = 1;
pub const TCA_FQ_CODEL_LIMIT: u16 = 2;
pub const TCA_FQ_CODEL_INTERVAL: u16 = 3;
pub const TCA_FQ_CODEL_ECN: u16 = 4;
pub const TCA_FQ_CODEL_FLOWS: u16 = 5;
pub const TCA_FQ_CODEL_QUANTUM: u16 = 6;

// u32 classifier.
pub const TCA_U32_CLASSID: u16 = 1;
pub const TCA_U32_SEL: u16 = 5;

/// Terminal selector flag: matching ends here.
pub const TC_U32_TERMINAL: u8 = 1;

/// Default u32 hash table id; filter handles live in its hex domain
/// (`0x800:node`).
pub const U32_DEFAULT_HTID: u32 = 0x800;

/// One u32 selector key (mirrors `struct tc_u32_key`). `val` and `mask`
/// are stored in network byte order.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TcU32Key {
    /// Mask, network order.
    pub mask: u32,
    /// Value after masking, network order.
    pub val: u32,
    /// Byte offset into the packet.
    pub off: i32,
    pub offmask: i32,
}

impl TcU32Key {
    /// Key matching `val`/`mask` (host order) at byte offset `off`.
    pub fn new(val: u32, mask: u32, off: i32) -> Self {
        Self {
            mask: mask.to_be(),
            val: (val & mask).to_be(),
            off,
            offmask: 0,
        }
    }
}

/// u32 selector header (mirrors `struct tc_u32_sel` without its flexible
/// key array, 16 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TcU32SelHdr {
    pub flags: u8,
    pub offshift: u8,
    pub nkeys: u8,
    pub pad: u8,
    pub offmask: u16,
    pub off: u16,
    pub offoff: i16,
    pub hoff: i16,
    pub hmask: u32,
}

/// A u32 selector: header plus keys, serialized back-to-back.
#[derive(Debug, Clone, Default)]
pub struct TcU32Sel {
    keys: Vec<TcU32Key>,
}

impl TcU32Sel {
    /// An empty terminal selector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a key.
    pub fn push(&mut self, key: TcU32Key) {
        self.keys.push(key);
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True when no keys were added.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Serialize to the kernel's wire layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let header = TcU32SelHdr {
            flags: TC_U32_TERMINAL,
            nkeys: self.keys.len() as u8,
            ..Default::default()
        };
        let mut out = header.as_bytes().to_vec();
        for key in &self.keys {
            out.extend_from_slice(key.as_bytes());
        }
        out
    }
}

// fw classifier.
pub const TCA_FW_CLASSID: u16 = 1;
pub const TCA_FW_MASK: u16 = 5;
