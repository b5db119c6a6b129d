//! Async rtnetlink socket with request/ack/dump transactions.

use std::sync::atomic::{AtomicU32, Ordering};

use bytes::BytesMut;
use netlink_sys::{Socket, SocketAddr, protocols};
use tokio::io::unix::AsyncFd;
use tracing::trace;
use zerocopy::IntoBytes as _;

use super::builder::MessageBuilder;
use super::message::{MessageIter, NLMSG_HDRLEN, NlMsgError, map_errno};
use crate::adapter::AdapterResult;

const RECV_BUF_SIZE: usize = 64 * 1024;

/// Nonblocking NETLINK_ROUTE socket driven by tokio's fd readiness.
pub struct NetlinkSocket {
    fd: AsyncFd<Socket>,
    seq: AtomicU32,
    pid: u32,
}

impl NetlinkSocket {
    /// Open and bind a NETLINK_ROUTE socket.
    pub fn new() -> AdapterResult<Self> {
        let mut socket = Socket::new(protocols::NETLINK_ROUTE)?;
        let addr = socket.bind_auto()?;
        socket.connect(&SocketAddr::new(0, 0))?;
        socket.set_non_blocking(true)?;

        Ok(Self {
            fd: AsyncFd::new(socket)?,
            seq: AtomicU32::new(1),
            pid: addr.port_number(),
        })
    }

    /// Next request sequence number.
    pub fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// The port ID the kernel assigned at bind time.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    async fn send(&self, buf: &[u8]) -> AdapterResult<()> {
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send(buf, 0)) {
                Ok(result) => {
                    result?;
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }

    async fn recv(&self) -> AdapterResult<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(RECV_BUF_SIZE);
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| inner.get_ref().recv(&mut buf, 0)) {
                Ok(result) => {
                    result?;
                    return Ok(buf.to_vec());
                }
                Err(_would_block) => continue,
            }
        }
    }
}

/// One-request-at-a-time netlink transactions.
///
/// The caller serializes access (the adapter holds this behind a mutex);
/// each transaction matches responses by sequence number.
pub struct NetlinkConnection {
    socket: NetlinkSocket,
}

impl NetlinkConnection {
    /// Open a connection.
    pub fn new() -> AdapterResult<Self> {
        Ok(Self {
            socket: NetlinkSocket::new()?,
        })
    }

    /// Send a request expecting an ACK; `operation` labels errors.
    pub async fn request_ack(
        &self,
        mut builder: MessageBuilder,
        operation: &str,
    ) -> AdapterResult<()> {
        let seq = self.socket.next_seq();
        builder.set_seq(seq);
        builder.set_pid(self.socket.pid());

        let msg = builder.finish();
        trace!(operation, seq, len = msg.len(), "netlink request");
        self.socket.send(&msg).await?;

        loop {
            let response = self.socket.recv().await?;
            for result in MessageIter::new(&response) {
                let (header, payload) = result?;
                if header.nlmsg_seq != seq {
                    continue;
                }
                if header.is_error() {
                    let err = NlMsgError::from_bytes(payload)?;
                    if err.is_ack() {
                        return Ok(());
                    }
                    return Err(map_errno(err.error, operation));
                }
            }
        }
    }

    /// Send a dump request and collect every response message (header
    /// included) until NLMSG_DONE.
    pub async fn dump(
        &self,
        mut builder: MessageBuilder,
        operation: &str,
    ) -> AdapterResult<Vec<Vec<u8>>> {
        let seq = self.socket.next_seq();
        builder.set_seq(seq);
        builder.set_pid(self.socket.pid());

        let msg = builder.finish();
        trace!(operation, seq, "netlink dump");
        self.socket.send(&msg).await?;

        let mut responses = Vec::new();
        loop {
            let data = self.socket.recv().await?;
            for result in MessageIter::new(&data) {
                let (header, payload) = result?;
                if header.nlmsg_seq != seq {
                    continue;
                }
                if header.is_error() {
                    let err = NlMsgError::from_bytes(payload)?;
                    if !err.is_ack() {
                        return Err(map_errno(err.error, operation));
                    }
                    continue;
                }
                if header.is_done() {
                    return Ok(responses);
                }

                let mut full = Vec::with_capacity(NLMSG_HDRLEN + payload.len());
                full.extend_from_slice(header.as_bytes());
                full.extend_from_slice(payload);
                responses.push(full);
            }
        }
    }
}
