//! On-the-wire control frames and protocol constants.
//!
//! The three frames here are fixed-layout little-endian PODs. They cross
//! the wire as raw bytes, so their layout is load-bearing: tests below
//! pin the exact sizes.

use std::{mem, slice};

use crate::type_alias::*;

/// Immediate value marking a send as a rendezvous start.
pub(crate) const IMM_RENDEZVOUS_START: Imm = 0;
/// Immediate value marking a send as a rendezvous reply.
pub(crate) const IMM_RENDEZVOUS_REPLY: Imm = 1;

/// Rendezvous-start send contexts per endpoint.
pub(crate) const START_DEPTH: usize = 128;
/// Rendezvous-reply send contexts per endpoint.
pub(crate) const REPLY_DEPTH: usize = 128;
/// Write send contexts per endpoint.
pub(crate) const WRITE_DEPTH: usize = 128;
/// Posted receive contexts per endpoint.
pub(crate) const RX_DEPTH: usize = 256;

/// Scatter/gather entries per work request.
pub(crate) const MAX_SGE: usize = 4;
/// Upper bound of concurrently outstanding work requests per endpoint.
pub(crate) const MAX_CONCURRENT_WR: usize = RX_DEPTH + START_DEPTH + REPLY_DEPTH + WRITE_DEPTH;

/// Payload segments a message may carry.
pub(crate) const MAX_DATA_FIELDS: usize = 4;
/// Hostname bytes carried in CM private data.
pub(crate) const MAX_HOSTNAME_LEN: usize = 16;

/// Address-resolution retry bound for transient binding conflicts.
pub(crate) const MAX_RESOLVE_RETRY: usize = 50_000;
/// First source port tried when `DMLC_NODE_HOST` pins the bind address.
pub(crate) const BASE_PORT: u16 = 9010;
/// CM address/route resolution timeout.
pub(crate) const TIMEOUT_MS: i32 = 1000;
/// Listen backlog of the CM listener.
pub(crate) const LISTEN_BACKLOG: i32 = 128;

/// Chunk size of the control-frame buffers: every send/receive context
/// must be able to hold either rendezvous frame.
pub(crate) const CHUNK_SIZE: usize = {
    let a = mem::size_of::<RendezvousStart>();
    let b = mem::size_of::<RendezvousReply>();
    if a > b {
        a
    } else {
        b
    }
};

/// First frame of the rendezvous handshake, sent by the message source.
///
/// Carried as the body of a send whose immediate is
/// [`IMM_RENDEZVOUS_START`].
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub(crate) struct RendezvousStart {
    /// Packed meta length in bytes.
    pub meta_len: u64,
    /// Number of payload segments that will follow the meta.
    pub data_num: u64,
    /// Length of each payload segment.
    pub data_len: [u64; MAX_DATA_FIELDS],
    /// Cookie identifying the sender's in-flight message buffer.
    pub origin_addr: u64,
}

/// Second frame of the rendezvous handshake, sent by the receiver.
///
/// Carried as the body of a send whose immediate is
/// [`IMM_RENDEZVOUS_REPLY`].
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub(crate) struct RendezvousReply {
    /// Address of the receive buffer on the replying node.
    pub addr: u64,
    /// Echo of [`RendezvousStart::origin_addr`].
    pub origin_addr: u64,
    /// Remote key granting write access to `addr`.
    pub rkey: RKey,
    /// Receive-slot index; immediate of the eventual data write.
    pub idx: u32,
}

/// Identity block exchanged as CM private data during connect/accept.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub(crate) struct RequestContext {
    pub node: u32,
    pub port: u16,
    pub hostname: [u8; MAX_HOSTNAME_LEN],
}

macro_rules! impl_pod_bytes {
    ($ty:ty) => {
        impl $ty {
            /// View the frame as raw bytes for posting.
            #[inline]
            pub fn as_bytes(&self) -> &[u8] {
                // SAFETY: `Self` is a repr(C) POD with no padding holes read here.
                unsafe {
                    slice::from_raw_parts(self as *const Self as *const u8, mem::size_of::<Self>())
                }
            }

            /// Read a frame back from a received buffer.
            ///
            /// # Safety
            ///
            /// `ptr` must point to at least `size_of::<Self>()` readable bytes.
            #[inline]
            pub unsafe fn read_from(ptr: *const u8) -> Self {
                (ptr as *const Self).read_unaligned()
            }
        }
    };
}

impl_pod_bytes!(RendezvousStart);
impl_pod_bytes!(RendezvousReply);
impl_pod_bytes!(RequestContext);

impl RequestContext {
    pub fn new(node: u32, port: u16, hostname: &str) -> Self {
        let mut name = [0u8; MAX_HOSTNAME_LEN];
        let bytes = hostname.as_bytes();
        // Trailing NUL mandatory, long hostnames truncate.
        let n = bytes.len().min(MAX_HOSTNAME_LEN - 1);
        name[..n].copy_from_slice(&bytes[..n]);
        Self {
            node,
            port,
            hostname: name,
        }
    }

    /// Hostname as a string, up to the first NUL.
    pub fn hostname_str(&self) -> &str {
        let end = self
            .hostname
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_HOSTNAME_LEN);
        std::str::from_utf8(&self.hostname[..end]).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout() {
        assert_eq!(mem::size_of::<RendezvousStart>(), 56);
        assert_eq!(mem::align_of::<RendezvousStart>(), 8);
        assert_eq!(mem::size_of::<RendezvousReply>(), 24);
        assert_eq!(mem::align_of::<RendezvousReply>(), 8);
        // 22 bytes of fields, padded to u32 alignment.
        assert_eq!(mem::size_of::<RequestContext>(), 24);
        assert_eq!(CHUNK_SIZE, 56);
        assert_eq!(MAX_CONCURRENT_WR, 640);
    }

    #[test]
    fn frame_roundtrip() {
        let start = RendezvousStart {
            meta_len: 48,
            data_num: 3,
            data_len: [8, 1024, 4, 0],
            origin_addr: 0xdead_beef,
        };
        let bytes = start.as_bytes();
        assert_eq!(bytes.len(), 56);
        // SAFETY: `bytes` is a full frame.
        let back = unsafe { RendezvousStart::read_from(bytes.as_ptr()) };
        assert_eq!(back.meta_len, 48);
        assert_eq!(back.data_num, 3);
        assert_eq!(back.data_len, [8, 1024, 4, 0]);
        assert_eq!(back.origin_addr, 0xdead_beef);

        let reply = RendezvousReply {
            addr: 0x7000_0000_0000,
            origin_addr: 0xdead_beef,
            rkey: 0x1234,
            idx: 17,
        };
        // SAFETY: same as above.
        let back = unsafe { RendezvousReply::read_from(reply.as_bytes().as_ptr()) };
        assert_eq!(back.addr, 0x7000_0000_0000);
        assert_eq!(back.rkey, 0x1234);
        assert_eq!(back.idx, 17);
    }

    #[test]
    fn request_context_hostname() {
        let ctx = RequestContext::new(3, 9100, "host-0.rack1.long-suffix");
        assert_eq!(ctx.hostname_str(), "host-0.rack1.lo");
        let ctx = RequestContext::new(3, 9100, "w1");
        assert_eq!(ctx.hostname_str(), "w1");
    }
}
