//! Netlink attribute (TLV) encoding.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Attribute alignment.
pub const NLA_ALIGNTO: usize = 4;

/// Attribute header length.
pub const NLA_HDRLEN: usize = 4;

/// Flag marking a nested attribute.
pub const NLA_F_NESTED: u16 = 0x8000;

/// Mask selecting the attribute type without its flag bits.
pub const NLA_TYPE_MASK: u16 = 0x3FFF;

/// Align a length to the attribute boundary.
#[inline]
pub const fn nla_align(len: usize) -> usize {
    (len + NLA_ALIGNTO - 1) & !(NLA_ALIGNTO - 1)
}

/// Attribute header (mirrors `struct nlattr`).
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NlAttr {
    /// Length including this header.
    pub nla_len: u16,
    /// Attribute type, possibly with flag bits.
    pub nla_type: u16,
}

impl NlAttr {
    /// Header for an attribute with `payload_len` bytes of payload.
    pub fn new(nla_type: u16, payload_len: usize) -> Self {
        Self {
            nla_len: (NLA_HDRLEN + payload_len) as u16,
            nla_type,
        }
    }
}
