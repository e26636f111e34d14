//! Verbs carrier: rendezvous frames over send-with-immediate, data over
//! one-sided writes.

use std::sync::Arc;
use std::{mem, ptr};

use rdma_sys::*;

use crate::endpoint::{CtxKind, Endpoint};
use crate::message::{decode_key, Message, MsgKind};
use crate::msgbuf::MessageBuffer;
use crate::transport::reconstruct;
use crate::type_alias::*;
use crate::util::math::{align_ceil, page_size};
use crate::util::env;
use crate::van::{BufferContext, RemoteTuple, Shared};
use crate::wire::*;

/// Set the immediate of a send work request.
#[inline]
pub(crate) fn wr_set_imm(wr: &mut ibv_send_wr, imm: Imm) {
    wr.imm_data_invalidated_rkey_union = imm_data_invalidated_rkey_union_t { imm_data: imm };
}

/// The verbs data path for one endpoint.
///
/// Methods never return errors: a failed post on a connected endpoint
/// is a protocol violation and panics, matching the completion-queue
/// contract.
#[derive(Clone)]
pub(crate) struct RdmaTransport {
    shared: Arc<Shared>,
    ep: Arc<Endpoint>,
    /// Side-local pool: the send pool on connect-side endpoints, the
    /// receive pool on accept-side ones.
    pool: Arc<crate::mempool::MemPool>,
    is_server: bool,
    pagesize: usize,
}

impl RdmaTransport {
    pub fn new(
        shared: Arc<Shared>,
        ep: Arc<Endpoint>,
        pool: Arc<crate::mempool::MemPool>,
    ) -> Self {
        Self {
            shared,
            ep,
            pool,
            is_server: env::role() == crate::message::Role::Server,
            pagesize: page_size(),
        }
    }

    pub fn register_memory(&self, msg: &Message) {
        let cache = self.shared.mr_cache();
        for seg in msg.data.iter().filter(|s| !s.is_empty()) {
            cache.ensure_registered(seg.as_ptr(), seg.len());
        }
    }

    pub fn add_meta(&self, msg: &mut Message) {
        if msg.meta.request {
            // SAFETY: requests always carry a keys segment.
            msg.meta.key = decode_key(unsafe { msg.data[0].as_slice() });
        }
        if msg.kind() == MsgKind::PushRequest {
            assert_eq!(msg.data.len(), 3, "push request must carry three segments");
            let vals = &msg.data[1];
            let entry = self.shared.mr_cache().get(vals.as_ptr());
            msg.meta.addr = vals.as_ptr() as u64;
            msg.meta.val_len = vals.len() as i32;
            msg.meta.option = entry.rkey;
        }
    }

    pub fn prepare_data(&self, msg: &Message, msg_buf: &mut MessageBuffer) {
        if msg.kind() != MsgKind::PushRequest {
            return;
        }
        let cache = self.shared.mr_cache();
        for seg in msg_buf.data.iter().filter(|s| !s.is_empty()) {
            msg_buf.mrs.push(cache.get(seg.as_ptr()));
        }
    }

    /// Post the one-sided write of a message whose remote slot is known.
    ///
    /// For push requests the values travel in a preceding unsignaled
    /// plain write at the page boundary after the meta; only the meta
    /// write-with-immediate is signaled, and the fabric's FIFO ordering
    /// makes the peer observe the values first.
    pub fn write_with_imm(&self, id: MsgBufId, remote: RemoteTuple) {
        let (raddr, rkey, idx) = remote;
        let msg_buf = self.shared.inflight_ref(id);

        let ctx_id = msg_buf
            .take_write_ctx()
            .unwrap_or_else(|| self.ep.free_write.pop());
        let ctx = self.shared.ctx_table.get(ctx_id);
        debug_assert_eq!(ctx.kind, CtxKind::Write);
        ctx.cookie.store(id, std::sync::atomic::Ordering::Release);

        if msg_buf.mrs.len() == 3 {
            // Values of a push request. Keys and lengths stay home: the
            // meta already carries them.
            let vals = &msg_buf.data[1];
            let mut sge = ibv_sge {
                addr: vals.as_ptr() as u64,
                length: vals.len() as u32,
                lkey: msg_buf.mrs[1].lkey,
            };

            // SAFETY: POD work request for FFI.
            let mut wr: ibv_send_wr = unsafe { mem::zeroed() };
            wr.wr_id = 0;
            wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE;
            wr.sg_list = &mut sge;
            wr.num_sge = 1;
            wr.wr.rdma.rkey = rkey;
            wr.wr.rdma.remote_addr = raddr + align_ceil(msg_buf.inline_len, self.pagesize) as u64;

            let mut bad_wr = ptr::null_mut();
            // SAFETY: the work request is correctly constructed.
            let rc = unsafe { ibv_post_send(self.ep.qp(), &mut wr, &mut bad_wr) };
            assert_eq!(rc, 0, "failed to post the payload write");
        } else {
            assert!(msg_buf.mrs.is_empty(), "unexpected MR count");
        }

        let mut sge = ibv_sge {
            addr: msg_buf.inline_buf.as_ptr() as u64,
            length: msg_buf.inline_len as u32,
            lkey: self.pool.local_key(msg_buf.inline_buf.as_ptr()),
        };

        // SAFETY: POD work request for FFI.
        let mut wr: ibv_send_wr = unsafe { mem::zeroed() };
        wr.wr_id = ctx.id as u64;
        wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM;
        wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.wr.rdma.remote_addr = raddr;
        wr.wr.rdma.rkey = rkey;
        wr_set_imm(&mut wr, idx);

        let mut bad_wr = ptr::null_mut();
        // SAFETY: the work request is correctly constructed.
        let rc = unsafe { ibv_post_send(self.ep.qp(), &mut wr, &mut bad_wr) };
        assert_eq!(rc, 0, "failed to post the meta write");
    }

    /// Announce an outgoing message to the peer: reserve the write
    /// bookmark, then send the shape of the message.
    pub fn send_rendezvous_begin(&self, msg: &Message, id: MsgBufId) {
        let msg_buf = self.shared.inflight_ref(id);

        // Bookmark the eventual data write so the reply handler cannot
        // stall on an empty write list inside the poller.
        msg_buf.reserve_write_ctx(self.ep.free_write.pop());

        let ctx = self.shared.ctx_table.get(self.ep.free_start.pop());
        debug_assert_eq!(ctx.kind, CtxKind::RendezvousStart);

        let mut req = RendezvousStart {
            meta_len: msg_buf.inline_len as u64,
            data_num: msg.data.len() as u64,
            data_len: [0; MAX_DATA_FIELDS],
            origin_addr: id,
        };
        for (i, seg) in msg.data.iter().enumerate() {
            req.data_len[i] = seg.len() as u64;
        }

        // SAFETY: the chunk is CHUNK_SIZE >= size_of::<RendezvousStart>().
        unsafe {
            ptr::copy_nonoverlapping(
                req.as_bytes().as_ptr(),
                ctx.chunk_ptr(),
                mem::size_of::<RendezvousStart>(),
            )
        };

        self.post_send_imm(&ctx, mem::size_of::<RendezvousStart>(), IMM_RENDEZVOUS_START);
        log::debug!(
            "rendezvous start: key={} peer={} msgbuf={}",
            msg.meta.key,
            self.ep.node_id(),
            id
        );
    }

    /// Answer a rendezvous start: allocate the landing buffer, stash it
    /// in the address pool, and send back its coordinates.
    pub fn send_rendezvous_reply(&self, req: RendezvousStart) {
        let meta_len = req.meta_len as usize;
        assert!(
            meta_len <= self.pagesize,
            "packed meta exceeds one page ({} bytes)",
            meta_len
        );

        let data_num = req.data_num as usize;
        let mut data_len = [0usize; MAX_DATA_FIELDS];
        let mut data_total = 0usize;
        for i in 0..data_num {
            data_len[i] = req.data_len[i] as usize;
            data_total += data_len[i];
        }

        // Workers receive meta only; servers also land the payload at
        // the page boundary after the meta.
        let buf_len = if self.is_server {
            self.pagesize + data_total
        } else {
            self.pagesize
        };
        let buffer = self.pool.alloc(buf_len);
        let addr = buffer.as_ptr() as u64;
        let rkey = self.pool.remote_key(buffer.as_ptr());

        let bc = Arc::new(BufferContext {
            buffer,
            meta_len,
            data_num,
            data_len,
        });
        let idx = self.shared.addr_pool.store(bc);

        let ctx = self.shared.ctx_table.get(self.ep.free_reply.pop());
        debug_assert_eq!(ctx.kind, CtxKind::RendezvousReply);

        let resp = RendezvousReply {
            addr,
            origin_addr: req.origin_addr,
            rkey,
            idx,
        };
        // SAFETY: the chunk is CHUNK_SIZE >= size_of::<RendezvousReply>().
        unsafe {
            ptr::copy_nonoverlapping(
                resp.as_bytes().as_ptr(),
                ctx.chunk_ptr(),
                mem::size_of::<RendezvousReply>(),
            )
        };

        self.post_send_imm(&ctx, mem::size_of::<RendezvousReply>(), IMM_RENDEZVOUS_REPLY);
        log::debug!(
            "rendezvous reply: peer={} slot={} addr={:#x}",
            self.ep.node_id(),
            idx,
            addr
        );
    }

    fn post_send_imm(&self, ctx: &crate::endpoint::WrContext, len: usize, imm: Imm) {
        let mut sge = ibv_sge {
            addr: ctx.chunk_ptr() as u64,
            length: len as u32,
            lkey: ctx.lkey,
        };

        // SAFETY: POD work request for FFI.
        let mut wr: ibv_send_wr = unsafe { mem::zeroed() };
        wr.wr_id = ctx.id as u64;
        wr.opcode = ibv_wr_opcode::IBV_WR_SEND_WITH_IMM;
        wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr_set_imm(&mut wr, imm);

        let mut bad_wr = ptr::null_mut();
        // SAFETY: the work request is correctly constructed.
        let rc = unsafe { ibv_post_send(self.ep.qp(), &mut wr, &mut bad_wr) };
        assert_eq!(rc, 0, "failed to post a rendezvous send");
    }

    pub fn send_push_request(&self, _msg: &Message, id: MsgBufId, remote: RemoteTuple) {
        self.write_with_imm(id, remote);
    }

    pub fn send_push_response(&self, _msg: &Message, id: MsgBufId, remote: RemoteTuple) {
        self.write_with_imm(id, remote);
    }

    pub fn send_pull_request(&self, _msg: &Message, id: MsgBufId, remote: RemoteTuple) {
        self.write_with_imm(id, remote);
    }

    /// Pull responses bypass the receive slot for their payload: the
    /// values go straight into the worker's application buffer, whose
    /// address and rkey arrived with the worker's first push request.
    pub fn send_pull_response(&self, msg: &Message, id: MsgBufId, remote: RemoteTuple) {
        let raddr = msg.meta.addr;
        let rkey = msg.meta.option;

        let msg_buf = self.shared.inflight_ref(id);
        let vals = &msg_buf.data[1];
        let entry = self.shared.mr_cache().get(vals.as_ptr());

        let mut sge = ibv_sge {
            addr: vals.as_ptr() as u64,
            length: vals.len() as u32,
            lkey: entry.lkey,
        };

        // SAFETY: POD work request for FFI.
        let mut wr: ibv_send_wr = unsafe { mem::zeroed() };
        wr.wr_id = 0;
        wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.wr.rdma.remote_addr = raddr;
        wr.wr.rdma.rkey = rkey;

        let mut bad_wr = ptr::null_mut();
        // SAFETY: the work request is correctly constructed.
        let rc = unsafe { ibv_post_send(self.ep.qp(), &mut wr, &mut bad_wr) };
        assert_eq!(rc, 0, "failed to post the pull-response value write");

        // Values first, then the meta with the immediate; FIFO ordering
        // makes the worker observe them in that order.
        self.write_with_imm(id, remote);
    }

    pub fn recv_push_request(&self, msg: &mut Message, bc: &Arc<BufferContext>) -> usize {
        reconstruct::push_request(msg, bc, self.pagesize)
    }

    pub fn recv_push_response(&self, msg: &mut Message, bc: &Arc<BufferContext>) -> usize {
        reconstruct::push_response(msg, bc)
    }

    pub fn recv_pull_request(&self, msg: &mut Message, bc: &Arc<BufferContext>) -> usize {
        reconstruct::pull_request(msg, bc)
    }

    pub fn recv_pull_response(&self, msg: &mut Message, bc: &Arc<BufferContext>) -> usize {
        reconstruct::pull_response(msg, bc)
    }
}
