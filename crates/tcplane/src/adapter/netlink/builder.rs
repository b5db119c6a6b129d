//! Request builder for netlink messages.

use zerocopy::{Immutable, IntoBytes};

use super::attr::{NLA_F_NESTED, NlAttr, nla_align};
use super::message::{NLMSG_HDRLEN, NlMsgHdr, nlmsg_align};

/// Token returned by [`MessageBuilder::nest_start`]; finalizes the nested
/// attribute's length.
#[derive(Debug, Clone, Copy)]
pub struct NestToken {
    offset: usize,
}

/// Incrementally builds one netlink request.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    /// Start a message with the given type and flags.
    pub fn new(msg_type: u16, flags: u16) -> Self {
        let header = NlMsgHdr::new(msg_type, flags);
        let mut buf = vec![0u8; NLMSG_HDRLEN];
        buf[..std::mem::size_of::<NlMsgHdr>()].copy_from_slice(header.as_bytes());
        Self { buf }
    }

    /// Append raw bytes, padding to message alignment.
    pub fn append_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        let aligned = nlmsg_align(self.buf.len());
        self.buf.resize(aligned, 0);
    }

    /// Append a fixed-layout struct.
    pub fn append<T: IntoBytes + Immutable>(&mut self, data: &T) {
        self.append_bytes(data.as_bytes());
    }

    /// Append an attribute with arbitrary payload.
    pub fn append_attr(&mut self, attr_type: u16, data: &[u8]) {
        let attr = NlAttr::new(attr_type, data.len());
        self.buf.extend_from_slice(attr.as_bytes());
        self.buf.extend_from_slice(data);
        let aligned = nla_align(self.buf.len());
        self.buf.resize(aligned, 0);
    }

    /// Append a `u32` attribute (native endian).
    pub fn append_attr_u32(&mut self, attr_type: u16, value: u32) {
        self.append_attr(attr_type, &value.to_ne_bytes());
    }

    /// Append a null-terminated string attribute.
    pub fn append_attr_str(&mut self, attr_type: u16, value: &str) {
        let mut data = value.as_bytes().to_vec();
        data.push(0);
        self.append_attr(attr_type, &data);
    }

    /// Open a nested attribute; close it with [`MessageBuilder::nest_end`].
    pub fn nest_start(&mut self, attr_type: u16) -> NestToken {
        let offset = self.buf.len();
        let attr = NlAttr::new(attr_type | NLA_F_NESTED, 0);
        self.buf.extend_from_slice(attr.as_bytes());
        NestToken { offset }
    }

    /// Close a nested attribute, fixing up its length.
    pub fn nest_end(&mut self, token: NestToken) {
        let len = (self.buf.len() - token.offset) as u16;
        self.buf[token.offset..token.offset + 2].copy_from_slice(&len.to_ne_bytes());
        let aligned = nla_align(self.buf.len());
        self.buf.resize(aligned, 0);
    }

    /// Set the sequence number.
    pub fn set_seq(&mut self, seq: u32) {
        self.buf[8..12].copy_from_slice(&seq.to_ne_bytes());
    }

    /// Set the sender port ID.
    pub fn set_pid(&mut self, pid: u32) {
        self.buf[12..16].copy_from_slice(&pid.to_ne_bytes());
    }

    /// Finalize the total length and return the wire bytes.
    pub fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        self.buf
    }

    /// Inspect the buffer under construction.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::netlink::attr::NLA_HDRLEN;
    use crate::adapter::netlink::message::{NLM_F_REQUEST, RTM_NEWQDISC};

    #[test]
    fn test_bare_message_is_header_sized() {
        let msg = MessageBuilder::new(RTM_NEWQDISC, NLM_F_REQUEST).finish();
        assert_eq!(msg.len(), NLMSG_HDRLEN);

        let header = NlMsgHdr::from_bytes(&msg).unwrap();
        assert_eq!(header.nlmsg_len as usize, NLMSG_HDRLEN);
        assert_eq!(header.nlmsg_type, RTM_NEWQDISC);
    }

    #[test]
    fn test_attribute_is_padded() {
        let mut builder = MessageBuilder::new(RTM_NEWQDISC, NLM_F_REQUEST);
        builder.append_attr_str(1, "htb");
        let msg = builder.finish();

        // "htb\0" is 4 bytes, already aligned; header + attr header + 4.
        assert_eq!(msg.len(), NLMSG_HDRLEN + NLA_HDRLEN + 4);
    }

    #[test]
    fn test_nested_attribute_length_fixup() {
        let mut builder = MessageBuilder::new(RTM_NEWQDISC, NLM_F_REQUEST);
        let nest = builder.nest_start(2);
        builder.append_attr_u32(1, 0xDEAD_BEEF);
        builder.nest_end(nest);
        let msg = builder.finish();

        let nest_offset = NLMSG_HDRLEN;
        let nla_len = u16::from_ne_bytes([msg[nest_offset], msg[nest_offset + 1]]);
        // Nest header + inner attr header + u32.
        assert_eq!(nla_len as usize, NLA_HDRLEN + NLA_HDRLEN + 4);
        let nla_type = u16::from_ne_bytes([msg[nest_offset + 2], msg[nest_offset + 3]]);
        assert_eq!(nla_type, 2 | NLA_F_NESTED);
    }

    #[test]
    fn test_seq_and_pid_land_in_header() {
        let mut builder = MessageBuilder::new(RTM_NEWQDISC, NLM_F_REQUEST);
        builder.set_seq(7);
        builder.set_pid(42);
        let msg = builder.finish();
        let header = NlMsgHdr::from_bytes(&msg).unwrap();
        assert_eq!(header.nlmsg_seq, 7);
        assert_eq!(header.nlmsg_pid, 42);
    }
}
