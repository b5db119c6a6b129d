//! Netlink message header, flags and response parsing.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::adapter::{AdapterError, AdapterResult};

/// Netlink message alignment.
pub const NLMSG_ALIGNTO: usize = 4;

/// Align a length to the netlink message boundary.
#[inline]
pub const fn nlmsg_align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

/// Size of the netlink message header.
pub const NLMSG_HDRLEN: usize = nlmsg_align(std::mem::size_of::<NlMsgHdr>());

/// Netlink message header (mirrors `struct nlmsghdr`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NlMsgHdr {
    /// Length of message including header.
    pub nlmsg_len: u32,
    /// Message type.
    pub nlmsg_type: u16,
    /// Request flags.
    pub nlmsg_flags: u16,
    /// Sequence number.
    pub nlmsg_seq: u32,
    /// Sending port ID.
    pub nlmsg_pid: u32,
}

impl NlMsgHdr {
    /// Create a header for the given type and flags.
    pub fn new(msg_type: u16, flags: u16) -> Self {
        Self {
            nlmsg_len: NLMSG_HDRLEN as u32,
            nlmsg_type: msg_type,
            nlmsg_flags: flags,
            nlmsg_seq: 0,
            nlmsg_pid: 0,
        }
    }

    /// True for NLMSG_ERROR messages (errors and ACKs).
    pub fn is_error(&self) -> bool {
        self.nlmsg_type == NLMSG_ERROR
    }

    /// True for NLMSG_DONE (end of a multipart dump).
    pub fn is_done(&self) -> bool {
        self.nlmsg_type == NLMSG_DONE
    }

    /// Parse a header from the front of a buffer.
    pub fn from_bytes(data: &[u8]) -> AdapterResult<&Self> {
        Self::ref_from_prefix(data).map(|(hdr, _)| hdr).map_err(|_| {
            AdapterError::Io(format!(
                "truncated netlink header: {} of {} bytes",
                data.len(),
                NLMSG_HDRLEN
            ))
        })
    }
}

// Control message types.
pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;

// RTNetlink TC message types.
pub const RTM_NEWQDISC: u16 = 36;
pub const RTM_DELQDISC: u16 = 37;
pub const RTM_GETQDISC: u16 = 38;
pub const RTM_NEWTCLASS: u16 = 40;
pub const RTM_DELTCLASS: u16 = 41;
pub const RTM_GETTCLASS: u16 = 42;
pub const RTM_NEWTFILTER: u16 = 44;
pub const RTM_DELTFILTER: u16 = 45;
pub const RTM_GETTFILTER: u16 = 46;

// Request flags.
pub const NLM_F_REQUEST: u16 = 0x01;
pub const NLM_F_ACK: u16 = 0x04;
pub const NLM_F_ROOT: u16 = 0x100;
pub const NLM_F_MATCH: u16 = 0x200;
pub const NLM_F_DUMP: u16 = NLM_F_ROOT | NLM_F_MATCH;
pub const NLM_F_EXCL: u16 = 0x200;
pub const NLM_F_CREATE: u16 = 0x400;

/// Iterator over the messages packed into one receive buffer.
pub struct MessageIter<'a> {
    data: &'a [u8],
}

impl<'a> MessageIter<'a> {
    /// Iterate over `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for MessageIter<'a> {
    type Item = AdapterResult<(&'a NlMsgHdr, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < NLMSG_HDRLEN {
            return None;
        }

        let header = match NlMsgHdr::from_bytes(self.data) {
            Ok(h) => h,
            Err(e) => return Some(Err(e)),
        };

        let msg_len = header.nlmsg_len as usize;
        if msg_len < NLMSG_HDRLEN || msg_len > self.data.len() {
            return Some(Err(AdapterError::Io(format!(
                "invalid netlink message length {msg_len}"
            ))));
        }

        let payload = &self.data[NLMSG_HDRLEN..msg_len];
        let aligned = nlmsg_align(msg_len);
        self.data = if aligned >= self.data.len() {
            &[]
        } else {
            &self.data[aligned..]
        };

        Some(Ok((header, payload)))
    }
}

/// NLMSG_ERROR payload: an errno (0 for an ACK) plus the offending header.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, Immutable, KnownLayout)]
pub struct NlMsgError {
    /// Negative errno, or 0 for an ACK.
    pub error: i32,
    /// Header of the request that failed.
    pub msg: NlMsgHdr,
}

impl NlMsgError {
    /// Parse an error payload.
    pub fn from_bytes(data: &[u8]) -> AdapterResult<&Self> {
        Self::ref_from_prefix(data).map(|(err, _)| err).map_err(|_| {
            AdapterError::Io(format!("truncated NLMSG_ERROR: {} bytes", data.len()))
        })
    }

    /// True when this is an ACK rather than a failure.
    pub fn is_ack(&self) -> bool {
        self.error == 0
    }
}

/// Map a kernel errno (as carried in NLMSG_ERROR, negative) to the
/// adapter's error classes.
pub fn map_errno(error: i32, operation: &str) -> AdapterError {
    let errno = -error;
    match errno {
        libc::EEXIST => AdapterError::AlreadyExists,
        libc::EPERM | libc::EACCES => AdapterError::NotPermitted,
        libc::ENODEV => AdapterError::DeviceNotFound(operation.to_string()),
        _ => {
            let message = std::io::Error::from_raw_os_error(errno).to_string();
            AdapterError::KernelRejected(format!("{operation}: {message} (errno {errno})"))
        }
    }
}
