//! Per-peer connection state: the CM id and RC queue pair, send-context
//! free-lists, and the pre-posted receive ring.

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use ahash::RandomState;
use crossbeam::channel::{bounded, Receiver, Sender};
use dashmap::DashMap;
use rdma_sys::*;

use crate::mempool::{MemPool, PoolBuf};
use crate::message::Node;
use crate::type_alias::*;
use crate::wire::*;

/// Connection status of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnStatus {
    Idle,
    Connecting,
    Connected,
    Rejected,
}

/// What a work-request context is armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CtxKind {
    RendezvousStart,
    RendezvousReply,
    Write,
    Receive,
}

/// A work-request context. `wr_id` carries its table handle, so the CQ
/// poller never round-trips a pointer through the fabric.
pub(crate) struct WrContext {
    pub id: CtxHandle,
    pub kind: CtxKind,
    /// Control-frame chunk (send kinds) or landing pad (receive kind).
    /// Write contexts carry no bytes of their own.
    pub buf: Option<PoolBuf>,
    pub lkey: LKey,
    pub ep: Arc<Endpoint>,
    /// In-flight msgbuf id, set by the write path before posting.
    pub cookie: AtomicU64,
}

impl WrContext {
    #[inline]
    pub fn chunk_ptr(&self) -> *mut u8 {
        self.buf.as_ref().expect("context has no buffer").as_ptr()
    }
}

/// Process-wide registry resolving `wr_id` handles back to contexts.
pub(crate) struct CtxTable {
    map: DashMap<CtxHandle, Arc<WrContext>, RandomState>,
    next: AtomicU32,
}

impl CtxTable {
    pub fn new() -> Self {
        Self {
            map: DashMap::with_hasher(RandomState::new()),
            // Handle zero is the "unreserved" sentinel.
            next: AtomicU32::new(1),
        }
    }

    pub fn register(
        &self,
        kind: CtxKind,
        buf: Option<PoolBuf>,
        lkey: LKey,
        ep: Arc<Endpoint>,
    ) -> Arc<WrContext> {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let ctx = Arc::new(WrContext {
            id,
            kind,
            buf,
            lkey,
            ep,
            cookie: AtomicU64::new(0),
        });
        self.map.insert(id, ctx.clone());
        ctx
    }

    pub fn get(&self, id: CtxHandle) -> Arc<WrContext> {
        self.map
            .get(&id)
            .expect("work completion for unknown context")
            .clone()
    }

    pub fn remove(&self, id: CtxHandle) {
        self.map.remove(&id);
    }
}

/// Bounded blocking free-list of context handles.
///
/// A submitter that finds the list empty blocks until a completion
/// releases a context; this is the transport's sole admission control.
pub(crate) struct FreeList {
    tx: Sender<CtxHandle>,
    rx: Receiver<CtxHandle>,
}

impl FreeList {
    pub fn new(depth: usize) -> Self {
        let (tx, rx) = bounded(depth);
        Self { tx, rx }
    }

    /// Take a context, blocking until one is available.
    #[inline]
    pub fn pop(&self) -> CtxHandle {
        self.rx.recv().expect("free-list sender vanished")
    }

    /// Return a context. Never blocks: capacity equals the context count.
    #[inline]
    pub fn push(&self, handle: CtxHandle) {
        self.tx.send(handle).expect("free-list receiver vanished");
    }
}

/// A per-peer connection object.
pub(crate) struct Endpoint {
    node_id: AtomicI32,
    cm_id: AtomicPtr<rdma_cm_id>,

    status: Mutex<ConnStatus>,
    cv: Condvar,

    pub free_start: FreeList,
    pub free_reply: FreeList,
    pub free_write: FreeList,

    /// Handles of every context this endpoint registered, for teardown.
    ctx_ids: Mutex<Vec<CtxHandle>>,
}

unsafe impl Send for Endpoint {}
unsafe impl Sync for Endpoint {}

impl Endpoint {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            node_id: AtomicI32::new(Node::EMPTY),
            cm_id: AtomicPtr::new(ptr::null_mut()),
            status: Mutex::new(ConnStatus::Idle),
            cv: Condvar::new(),
            free_start: FreeList::new(START_DEPTH),
            free_reply: FreeList::new(REPLY_DEPTH),
            free_write: FreeList::new(WRITE_DEPTH),
            ctx_ids: Mutex::new(Vec::new()),
        })
    }

    #[inline]
    pub fn node_id(&self) -> NodeId {
        self.node_id.load(Ordering::Relaxed)
    }

    pub fn set_node_id(&self, id: NodeId) {
        self.node_id.store(id, Ordering::Relaxed);
    }

    #[inline]
    pub fn cm_id(&self) -> *mut rdma_cm_id {
        self.cm_id.load(Ordering::Acquire)
    }

    pub fn set_cm_id(&self, id: *mut rdma_cm_id) {
        self.cm_id.store(id, Ordering::Release);
    }

    /// The RC queue pair, valid once [`Endpoint::init`] ran.
    #[inline]
    pub fn qp(&self) -> *mut ibv_qp {
        let id = self.cm_id();
        assert!(!id.is_null(), "endpoint has no CM id");
        // SAFETY: the CM id stays valid until the endpoint is dropped.
        unsafe { (*id).qp }
    }

    pub fn status(&self) -> ConnStatus {
        *self.status.lock().unwrap()
    }

    pub fn set_status(&self, status: ConnStatus) {
        *self.status.lock().unwrap() = status;
        self.cv.notify_all();
    }

    /// Block until the status leaves `from`, returning the new status.
    pub fn wait_status_change(&self, from: ConnStatus) -> ConnStatus {
        let mut status = self.status.lock().unwrap();
        while *status == from {
            status = self.cv.wait(status).unwrap();
        }
        *status
    }

    /// Block until the status becomes `until`.
    pub fn wait_status(&self, until: ConnStatus) {
        let mut status = self.status.lock().unwrap();
        while *status != until {
            status = self.cv.wait(status).unwrap();
        }
    }

    /// Build the queue pair on the shared CQ, carve the send-context
    /// pools out of `pool`, and pre-post the whole receive ring.
    pub fn init(
        self: &Arc<Self>,
        cq: *mut ibv_cq,
        pd: *mut ibv_pd,
        pool: &Arc<MemPool>,
        table: &CtxTable,
    ) {
        let cm_id = self.cm_id();
        assert!(!cm_id.is_null(), "endpoint has no CM id");

        // SAFETY: POD attribute block for FFI.
        let mut attr: ibv_qp_init_attr = unsafe { mem::zeroed() };
        attr.send_cq = cq;
        attr.recv_cq = cq;
        attr.cap.max_send_wr = (START_DEPTH + REPLY_DEPTH + WRITE_DEPTH) as u32;
        attr.cap.max_recv_wr = RX_DEPTH as u32;
        attr.cap.max_send_sge = MAX_SGE as u32;
        attr.cap.max_recv_sge = MAX_SGE as u32;
        attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        attr.sq_sig_all = 0;

        // SAFETY: `cm_id` and `pd` are live verbs objects.
        let rc = unsafe { rdma_create_qp(cm_id, pd, &mut attr) };
        assert_eq!(rc, 0, "failed to create RC queue pair");

        let mut ids = self.ctx_ids.lock().unwrap();
        let mut make_send_ctx = |kind: CtxKind, list: &FreeList, with_buf: bool| {
            let (buf, lkey) = if with_buf {
                let buf = pool.alloc(CHUNK_SIZE);
                let lkey = pool.local_key(buf.as_ptr());
                (Some(buf), lkey)
            } else {
                (None, 0)
            };
            let ctx = table.register(kind, buf, lkey, self.clone());
            ids.push(ctx.id);
            list.push(ctx.id);
        };

        for _ in 0..START_DEPTH {
            make_send_ctx(CtxKind::RendezvousStart, &self.free_start, true);
        }
        for _ in 0..REPLY_DEPTH {
            make_send_ctx(CtxKind::RendezvousReply, &self.free_reply, true);
        }
        for _ in 0..WRITE_DEPTH {
            make_send_ctx(CtxKind::Write, &self.free_write, false);
        }

        for _ in 0..RX_DEPTH {
            let buf = pool.alloc(CHUNK_SIZE);
            let lkey = pool.local_key(buf.as_ptr());
            let ctx = table.register(CtxKind::Receive, Some(buf), lkey, self.clone());
            ids.push(ctx.id);
            self.post_recv(&ctx);
        }
    }

    /// Re-arm a receive slot with a chunk-sized SGE.
    pub fn post_recv(&self, ctx: &WrContext) {
        debug_assert_eq!(ctx.kind, CtxKind::Receive);

        let mut sge = ibv_sge {
            addr: ctx.chunk_ptr() as u64,
            length: CHUNK_SIZE as u32,
            lkey: ctx.lkey,
        };

        // SAFETY: POD work request for FFI.
        let mut wr: ibv_recv_wr = unsafe { mem::zeroed() };
        wr.wr_id = ctx.id as u64;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;

        let mut bad_wr = ptr::null_mut();
        // SAFETY: the work request is correctly constructed.
        let rc = unsafe { ibv_post_recv(self.qp(), &mut wr, &mut bad_wr) };
        assert_eq!(rc, 0, "failed to post a receive work request");
    }

    /// Initiate graceful teardown and block until the CM reports IDLE.
    pub fn disconnect(&self) {
        let cm_id = self.cm_id();
        if cm_id.is_null() {
            return;
        }
        // SAFETY: live CM id.
        let rc = unsafe { rdma_disconnect(cm_id) };
        assert_eq!(rc, 0, "rdma_disconnect failed");
        self.wait_status(ConnStatus::Idle);
    }

    /// Contexts registered by this endpoint; the van clears them from
    /// the table before dropping the endpoint.
    pub fn take_ctx_ids(&self) -> Vec<CtxHandle> {
        mem::take(&mut self.ctx_ids.lock().unwrap())
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        let cm_id = self.cm_id.load(Ordering::Acquire);
        if cm_id.is_null() {
            return;
        }
        // SAFETY: the id was created by this endpoint's owner and is
        // not referenced anywhere else once the endpoint drops.
        unsafe {
            if !(*cm_id).qp.is_null() {
                rdma_destroy_qp(cm_id);
            }
            rdma_destroy_id(cm_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn status_transitions_wake_waiters() {
        let ep = Endpoint::new();
        assert_eq!(ep.status(), ConnStatus::Idle);

        ep.set_status(ConnStatus::Connecting);
        let ep2 = ep.clone();
        let waiter = thread::spawn(move || ep2.wait_status_change(ConnStatus::Connecting));

        thread::sleep(Duration::from_millis(20));
        ep.set_status(ConnStatus::Connected);
        assert_eq!(waiter.join().unwrap(), ConnStatus::Connected);
    }

    #[test]
    fn free_list_blocks_when_drained() {
        let list = FreeList::new(2);
        list.push(1);
        list.push(2);
        assert_eq!(list.pop(), 1);
        assert_eq!(list.pop(), 2);

        let handle = {
            let rx_blocked = thread::spawn({
                let rx = list.rx.clone();
                move || rx.recv().unwrap()
            });
            thread::sleep(Duration::from_millis(20));
            assert!(!rx_blocked.is_finished(), "pop must block while empty");
            list.push(3);
            rx_blocked.join().unwrap()
        };
        assert_eq!(handle, 3);
    }
}
