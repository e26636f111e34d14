//! Data-path transports.
//!
//! One rendezvous protocol, three carriers: plain verbs RDMA, the
//! shared-memory fast path for same-host peers, and (behind the
//! `fabric` feature) libfabric RMA for EFA. All three implement the
//! same send/receive contract; the van picks an arm per endpoint at
//! connect time.

mod ipc;
mod rdma;

pub(crate) use ipc::IpcTransport;
pub(crate) use rdma::RdmaTransport;

use std::sync::Arc;

use crate::message::{encode_key, Message, Segment};
use crate::msgbuf::MessageBuffer;
use crate::type_alias::*;
use crate::util::math::align_ceil;
use crate::van::{BufferContext, RemoteTuple};
use crate::wire::RendezvousStart;

/// Per-endpoint transport, dispatching the shared contract to one of
/// the carrier implementations.
pub(crate) enum Transport {
    Rdma(RdmaTransport),
    Ipc(IpcTransport),
    #[cfg(feature = "fabric")]
    Fabric(crate::fabric::FabricTransport),
}

macro_rules! dispatch {
    ($self:ident, $t:ident => $body:expr) => {
        match $self {
            Transport::Rdma($t) => $body,
            Transport::Ipc($t) => $body,
            #[cfg(feature = "fabric")]
            Transport::Fabric($t) => $body,
        }
    };
}

impl Transport {
    /// Idempotently register every payload buffer of an outgoing message.
    pub fn register_memory(&self, msg: &Message) {
        dispatch!(self, t => t.register_memory(msg))
    }

    /// Write the protocol fields (`key`, and for push requests the
    /// value-buffer address triple) into the outgoing meta.
    pub fn add_meta(&self, msg: &mut Message) {
        dispatch!(self, t => t.add_meta(msg))
    }

    /// Attach the registration triples of a push-request's payload to
    /// its message buffer.
    pub fn prepare_data(&self, msg: &Message, msg_buf: &mut MessageBuffer) {
        dispatch!(self, t => t.prepare_data(msg, msg_buf))
    }

    /// Step 1 of the rendezvous: announce the message shape.
    pub fn send_rendezvous_begin(&self, msg: &Message, id: MsgBufId) {
        dispatch!(self, t => t.send_rendezvous_begin(msg, id))
    }

    /// Step 2 of the rendezvous: allocate a receive slot and answer.
    pub fn send_rendezvous_reply(&self, req: RendezvousStart) {
        dispatch!(self, t => t.send_rendezvous_reply(req))
    }

    /// Step 4: the one-sided data write.
    pub fn write_with_imm(&self, id: MsgBufId, remote: RemoteTuple) {
        dispatch!(self, t => t.write_with_imm(id, remote))
    }

    pub fn send_push_request(&self, msg: &Message, id: MsgBufId, remote: RemoteTuple) {
        dispatch!(self, t => t.send_push_request(msg, id, remote))
    }

    pub fn send_push_response(&self, msg: &Message, id: MsgBufId, remote: RemoteTuple) {
        dispatch!(self, t => t.send_push_response(msg, id, remote))
    }

    pub fn send_pull_request(&self, msg: &Message, id: MsgBufId, remote: RemoteTuple) {
        dispatch!(self, t => t.send_pull_request(msg, id, remote))
    }

    pub fn send_pull_response(&self, msg: &Message, id: MsgBufId, remote: RemoteTuple) {
        dispatch!(self, t => t.send_pull_response(msg, id, remote))
    }

    pub fn recv_push_request(&self, msg: &mut Message, bc: &Arc<BufferContext>) -> usize {
        dispatch!(self, t => t.recv_push_request(msg, bc))
    }

    pub fn recv_push_response(&self, msg: &mut Message, bc: &Arc<BufferContext>) -> usize {
        dispatch!(self, t => t.recv_push_response(msg, bc))
    }

    pub fn recv_pull_request(&self, msg: &mut Message, bc: &Arc<BufferContext>) -> usize {
        dispatch!(self, t => t.recv_pull_request(msg, bc))
    }

    pub fn recv_pull_response(&self, msg: &mut Message, bc: &Arc<BufferContext>) -> usize {
        dispatch!(self, t => t.recv_pull_response(msg, bc))
    }
}

/// A one-value segment synthesized from a meta field.
#[inline]
pub(crate) fn functional_segment(bytes: &[u8]) -> Segment {
    Segment::from_vec(bytes.to_vec())
}

/// Receive-side reconstruction shared by every carrier. The buffer
/// layout is fixed by the protocol, not by the carrier: meta at offset
/// zero, push-request values at the next page boundary after it.
pub(crate) mod reconstruct {
    use super::*;

    /// push-request: keys and lengths synthesized from the meta, values
    /// pointing into the receive buffer.
    pub fn push_request(msg: &mut Message, bc: &Arc<BufferContext>, pagesize: usize) -> usize {
        assert!(msg.meta.push && msg.meta.request);
        assert_eq!(bc.data_num, 3, "push request must carry three segments");

        let meta_len = msg.meta.packed_len();
        let val_len = bc.data_len[1];
        let cur = (bc.buffer.as_ptr() as usize + align_ceil(meta_len, pagesize)) as *mut u8;

        let keys = functional_segment(&encode_key(msg.meta.key));
        // SAFETY: the slot buffer stays alive while `bc` is alive, and the
        // peer placed `val_len` bytes at the page boundary after the meta.
        let vals = unsafe { Segment::with_owner(cur, val_len, bc.clone()) };
        let lens = functional_segment(&msg.meta.val_len.to_le_bytes());

        let total = keys.len() + vals.len() + lens.len();
        msg.data.push(keys);
        msg.data.push(vals);
        msg.data.push(lens);
        total
    }

    /// push-response: meta only.
    pub fn push_response(_msg: &mut Message, bc: &Arc<BufferContext>) -> usize {
        assert_eq!(bc.data_num, 0, "push response carries no payload");
        0
    }

    /// pull-request: synthesized keys plus an empty value segment to
    /// satisfy the key-value application's shape check.
    pub fn pull_request(msg: &mut Message, _bc: &Arc<BufferContext>) -> usize {
        let keys = functional_segment(&encode_key(msg.meta.key));
        let vals = Segment::empty();

        let total = keys.len() + vals.len();
        msg.data.push(keys);
        msg.data.push(vals);
        total
    }

    /// pull-response: values live in the worker's own buffer, where the
    /// server wrote them directly.
    pub fn pull_response(msg: &mut Message, _bc: &Arc<BufferContext>) -> usize {
        let keys = functional_segment(&encode_key(msg.meta.key));
        // SAFETY: `meta.addr` is the application-supplied value buffer of
        // this very worker; it outlives the message by contract.
        let vals =
            unsafe { Segment::borrowed(msg.meta.addr as *mut u8, msg.meta.val_len as usize) };
        let lens = functional_segment(&msg.meta.val_len.to_le_bytes());

        let total = keys.len() + vals.len() + lens.len();
        msg.data.push(keys);
        msg.data.push(vals);
        msg.data.push(lens);
        total
    }
}
