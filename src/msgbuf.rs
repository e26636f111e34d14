//! In-flight message state on the sending side.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::mempool::{MrEntry, PoolBuf};
use crate::message::Segment;
use crate::type_alias::*;

/// Everything the transport must keep alive from `send_msg` until the
/// data write completes: the packed meta block (pinned in the send
/// pool), the payload segments, and the keys of their registrations.
///
/// The memory regions themselves are owned by the MR cache; only the
/// `(addr, len, lkey)` triples are copied here.
pub(crate) struct MessageBuffer {
    /// Packed meta block from the send pool.
    pub inline_buf: PoolBuf,
    /// Exact packed meta length (`inline_buf` is page-rounded).
    pub inline_len: usize,
    /// Payload segments of the original message.
    pub data: Vec<Segment>,
    /// Registration triples of the payload segments, in segment order.
    pub mrs: Vec<MrEntry>,
    /// Write context reserved at rendezvous time, if any.
    /// Zero means unreserved; context handles start at one.
    write_ctx: AtomicU32,
}

impl MessageBuffer {
    pub fn new(inline_buf: PoolBuf, inline_len: usize, data: Vec<Segment>) -> Self {
        Self {
            inline_buf,
            inline_len,
            data,
            mrs: Vec::new(),
            write_ctx: AtomicU32::new(0),
        }
    }

    /// Bookmark a reserved write context for the upcoming data write.
    pub fn reserve_write_ctx(&self, handle: CtxHandle) {
        let prev = self.write_ctx.swap(handle, Ordering::AcqRel);
        debug_assert_eq!(prev, 0, "write context reserved twice");
    }

    /// Take the bookmarked write context, if one was reserved.
    pub fn take_write_ctx(&self) -> Option<CtxHandle> {
        match self.write_ctx.swap(0, Ordering::AcqRel) {
            0 => None,
            h => Some(h),
        }
    }
}
