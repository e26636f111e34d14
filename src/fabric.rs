//! libfabric variant of the van, for AWS EFA.
//!
//! Replaces the verbs QP with an `FI_EP_RDM` endpoint bound to an
//! address vector and a tagged CQ. There is no CM: peers are addressed
//! by the endpoint names the framework's bootstrap channel exchanged in
//! [`Node::endpoint_name`]. The rendezvous protocol is unchanged;
//! control frames travel as tagged sends whose tag sets the top bit and
//! carries the immediate in the low bits, and data writes deliver the
//! receive-slot index as remote CQ data.

use std::collections::HashMap;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use ahash::RandomState;
use crossbeam::channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use libfabric_sys::*;

use crate::addrpool::AddressPool;
use crate::endpoint::{CtxKind, FreeList};
use crate::mempool::{BufReturn, PoolBuf, PoolInner};
use crate::message::{decode_key, Message, Meta, MsgKind, Node, Role};
use crate::msgbuf::MessageBuffer;
use crate::transport::reconstruct;
use crate::type_alias::*;
use crate::util::env;
use crate::util::math::{align_ceil, page_size, roundup};
use crate::util::page_alloc::alloc_slab;
use crate::van::{BufferContext, RemoteTuple, RendezvousCache};
use crate::wire::*;

/// `FI_VERSION(1, 8)`.
const FI_VERSION_1_8: u32 = (1 << 16) | 8;

/// Endpoint names fit the 64-byte handle limit minus 8 tag bytes.
const MAX_EP_ADDR: usize = 56;

/// Top tag bit marks control frames. Control tags carry the sender's
/// node id in bits 32..63 and the protocol immediate in the low bits;
/// everything else in the namespace stays free for slot indices.
const TAG_CONTROL: u64 = 1 << 63;

#[inline]
fn control_tag(sender: NodeId, imm: Imm) -> u64 {
    TAG_CONTROL | ((sender as u32 as u64) << 32) | imm as u64
}

#[inline]
fn control_tag_parts(tag: u64) -> (NodeId, Imm) {
    (((tag >> 32) & 0x7fff_ffff) as NodeId, tag as u32)
}

#[track_caller]
fn check(ret: i32, call: &'static str) {
    if ret != 0 {
        // SAFETY: FFI string lookup.
        let msg = unsafe { std::ffi::CStr::from_ptr(fi_strerror(-ret)) };
        panic!("{} failed: {} ({:?})", call, ret, msg);
    }
}

macro_rules! fi_op {
    ($table:expr, $op:ident) => {
        // SAFETY: live provider object; op tables are fully populated.
        unsafe { (*$table).$op.expect(concat!("provider lacks ", stringify!($op))) }
    };
}

/// The provider objects backing one fabric van.
struct FabricContext {
    info: *mut fi_info,
    fabric: *mut fid_fabric,
    domain: *mut fid_domain,
    cq: *mut fid_cq,
    av: *mut fid_av,
    ep: *mut fid_ep,
    addr: [u8; MAX_EP_ADDR],
    addr_len: usize,
}

unsafe impl Send for FabricContext {}
unsafe impl Sync for FabricContext {}

impl FabricContext {
    fn init() -> Self {
        // SAFETY: FFI throughout; each object is checked before use.
        unsafe {
            let hints = fi_dupinfo(ptr::null());
            assert!(!hints.is_null(), "failed to allocate fabric hints");
            (*hints).caps = (FI_TAGGED | FI_MSG | FI_RMA) as u64;
            (*hints).mode = FI_CONTEXT as u64;
            (*(*hints).ep_attr).type_ = FI_EP_RDM;
            (*(*hints).domain_attr).av_type = FI_AV_TABLE;
            (*(*hints).domain_attr).control_progress = FI_PROGRESS_AUTO;
            (*(*hints).domain_attr).data_progress = FI_PROGRESS_AUTO;
            (*(*hints).tx_attr).msg_order = FI_ORDER_SAS as u64;
            (*(*hints).rx_attr).msg_order = FI_ORDER_SAS as u64;
            (*(*hints).fabric_attr).prov_name =
                libc::strdup(b"efa\0".as_ptr() as *const libc::c_char);

            let mut info = ptr::null_mut();
            let ret = fi_getinfo(FI_VERSION_1_8, ptr::null(), ptr::null(), 0, hints, &mut info);
            check(ret, "fi_getinfo");
            fi_freeinfo(hints);

            let mut fabric = ptr::null_mut();
            let ret = fi_fabric((*info).fabric_attr, &mut fabric, ptr::null_mut());
            check(ret, "fi_fabric");

            let mut domain = ptr::null_mut();
            let ret = fi_op!((*fabric).ops, domain)(fabric, info, &mut domain, ptr::null_mut());
            check(ret, "fi_domain");

            let mut av_attr: fi_av_attr = mem::zeroed();
            av_attr.type_ = FI_AV_TABLE;
            let mut av = ptr::null_mut();
            let ret = fi_op!((*domain).ops, av_open)(domain, &mut av_attr, &mut av, ptr::null_mut());
            check(ret, "fi_av_open");

            let mut cq_attr: fi_cq_attr = mem::zeroed();
            cq_attr.format = FI_CQ_FORMAT_TAGGED;
            let mut cq = ptr::null_mut();
            let ret = fi_op!((*domain).ops, cq_open)(domain, &mut cq_attr, &mut cq, ptr::null_mut());
            check(ret, "fi_cq_open");

            let mut ep = ptr::null_mut();
            let ret = fi_op!((*domain).ops, endpoint)(domain, info, &mut ep, ptr::null_mut());
            check(ret, "fi_endpoint");

            let bind = fi_op!((*ep).fid.ops, bind);
            let ret = bind(&mut (*ep).fid, &mut (*cq).fid, (FI_SEND | FI_RECV) as u64);
            check(ret, "fi_ep_bind(cq)");
            let ret = bind(&mut (*ep).fid, &mut (*av).fid, 0);
            check(ret, "fi_ep_bind(av)");

            let ret = fi_op!((*ep).fid.ops, control)(
                &mut (*ep).fid,
                FI_ENABLE as libc::c_int,
                ptr::null_mut(),
            );
            check(ret, "fi_enable");

            let mut addr = [0u8; MAX_EP_ADDR];
            let mut addr_len = MAX_EP_ADDR;
            let ret = fi_op!((*ep).cm, getname)(
                &mut (*ep).fid,
                addr.as_mut_ptr() as *mut libc::c_void,
                &mut addr_len,
            );
            check(ret, "fi_getname");
            assert!(addr_len <= MAX_EP_ADDR, "endpoint name too long");

            log::debug!("fabric endpoint created, addr_len={}", addr_len);
            Self {
                info,
                fabric,
                domain,
                cq,
                av,
                ep,
                addr,
                addr_len,
            }
        }
    }

    fn av_insert(&self, name: &[u8]) -> fi_addr_t {
        assert!(!name.is_empty() && name.len() <= MAX_EP_ADDR);
        let mut fi_addr: fi_addr_t = FI_ADDR_UNSPEC as fi_addr_t;
        // SAFETY: live AV, valid address bytes.
        let ret = unsafe {
            fi_op!((*self.av).ops, insert)(
                self.av,
                name.as_ptr() as *const libc::c_void,
                1,
                &mut fi_addr,
                0,
                ptr::null_mut(),
            )
        };
        assert_eq!(ret, 1, "fi_av_insert failed");
        fi_addr
    }
}

impl Drop for FabricContext {
    fn drop(&mut self) {
        // SAFETY: reverse construction order; each close drops one ref.
        unsafe {
            fi_close(&mut (*self.ep).fid);
            fi_close(&mut (*self.cq).fid);
            fi_close(&mut (*self.av).fid);
            fi_close(&mut (*self.domain).fid);
            fi_close(&mut (*self.fabric).fid);
            fi_freeinfo(self.info);
        }
    }
}

/// Slab registration record: descriptor for local SGEs, key for peers.
#[derive(Clone, Copy)]
struct FabricMr {
    start: usize,
    len: usize,
    mr: *mut fid_mr,
    desc: *mut libc::c_void,
    key: u64,
}

unsafe impl Send for FabricMr {}
unsafe impl Sync for FabricMr {}

fn mr_reg(domain: *mut fid_domain, ptr_: *mut u8, len: usize) -> FabricMr {
    let access = (FI_SEND | FI_RECV | FI_WRITE | FI_REMOTE_WRITE | FI_READ) as u64;
    let mut mr = ptr::null_mut();
    // SAFETY: live domain; the buffer outlives the registration.
    let ret = unsafe {
        fi_op!((*domain).mr, reg)(
            &mut (*domain).fid,
            ptr_ as *const libc::c_void,
            len,
            access,
            0,
            0,
            0,
            &mut mr,
            ptr::null_mut(),
        )
    };
    check(ret, "fi_mr_reg");
    // SAFETY: just registered.
    let (desc, key) = unsafe { ((*mr).mem_desc, (*mr).key) };
    FabricMr {
        start: ptr_ as usize,
        len,
        mr,
        desc,
        key,
    }
}

/// Page-aligned pool over fabric-registered slabs.
pub(crate) struct FabricPool {
    domain: *mut fid_domain,
    inner: Mutex<PoolInner>,
    mrs: Mutex<Vec<FabricMr>>,
}

unsafe impl Send for FabricPool {}
unsafe impl Sync for FabricPool {}

impl FabricPool {
    fn new(domain: *mut fid_domain) -> Arc<Self> {
        Arc::new(Self {
            domain,
            inner: Mutex::new(PoolInner::new()),
            mrs: Mutex::new(Vec::new()),
        })
    }

    fn alloc(self: &Arc<Self>, len: usize) -> PoolBuf {
        let mut inner = self.inner.lock().unwrap();
        let (ptr_, rounded) = match inner.alloc(len) {
            Some(v) => v,
            None => {
                let slab_len = inner.next_slab_len(roundup(len.max(1), page_size()));
                let mem = alloc_slab(slab_len);
                let mr = mr_reg(self.domain, mem.ptr, mem.len);
                self.mrs.lock().unwrap().push(mr);
                inner.add_slab(mem, 0, 0);
                inner.alloc(len).expect("fresh slab cannot satisfy alloc")
            }
        };
        PoolBuf::new(
            ptr::NonNull::new(ptr_).unwrap(),
            rounded,
            Some(self.clone() as Arc<dyn BufReturn>),
        )
    }

    fn mr_of(&self, ptr_: *mut u8) -> FabricMr {
        let addr = ptr_ as usize;
        *self
            .mrs
            .lock()
            .unwrap()
            .iter()
            .find(|mr| (mr.start..mr.start + mr.len).contains(&addr))
            .expect("pointer not covered by any fabric slab")
    }

    fn local_desc(&self, ptr_: *mut u8) -> *mut libc::c_void {
        self.mr_of(ptr_).desc
    }

    fn remote_key(&self, ptr_: *mut u8) -> u64 {
        self.mr_of(ptr_).key
    }
}

impl BufReturn for FabricPool {
    fn return_buf(&self, ptr_: *mut u8) {
        self.inner.lock().unwrap().free(ptr_);
    }
}

impl Drop for FabricPool {
    fn drop(&mut self) {
        for mr in self.mrs.lock().unwrap().iter() {
            // SAFETY: registered by this pool.
            unsafe { fi_close(&mut (*mr.mr).fid) };
        }
    }
}

/// Registration cache for caller-owned payload buffers.
struct FabricMrCache {
    domain: *mut fid_domain,
    map: DashMap<usize, FabricMr, RandomState>,
}

unsafe impl Send for FabricMrCache {}
unsafe impl Sync for FabricMrCache {}

impl FabricMrCache {
    fn ensure_registered(&self, ptr_: *mut u8, len: usize) -> FabricMr {
        *self
            .map
            .entry(ptr_ as usize)
            .or_insert_with(|| mr_reg(self.domain, ptr_, len))
    }

    fn get(&self, ptr_: *mut u8) -> FabricMr {
        *self
            .map
            .get(&(ptr_ as usize))
            .expect("payload buffer not registered")
    }
}

impl Drop for FabricMrCache {
    fn drop(&mut self) {
        for entry in self.map.iter() {
            // SAFETY: registered by this cache.
            unsafe { fi_close(&mut (*entry.mr).fid) };
        }
    }
}

/// A fabric work context. `FI_CONTEXT` mode requires the first field to
/// be provider-writable scratch; the pointer passed as the op context
/// is the address of this struct.
#[repr(C)]
pub(crate) struct FabricWrContext {
    /// Provider scratch, must stay first.
    _fi_ctx: [usize; 4],
    id: CtxHandle,
    kind: CtxKind,
    node_id: NodeId,
    buf: Option<PoolBuf>,
    cookie: AtomicU64,
}

unsafe impl Send for FabricWrContext {}
unsafe impl Sync for FabricWrContext {}

/// Per-peer state: the AV entry plus the send-context free-lists.
pub(crate) struct FabricEndpoint {
    pub node_id: NodeId,
    pub fi_addr: fi_addr_t,
    pub free_start: FreeList,
    pub free_reply: FreeList,
    pub free_write: FreeList,
}

/// State shared between the fabric van, its transports and the poller.
pub(crate) struct FabricShared {
    ctx: FabricContext,
    pool: Arc<FabricPool>,
    mr_cache: FabricMrCache,

    wr_table: DashMap<CtxHandle, Arc<FabricWrContext>, RandomState>,
    next_wr_id: std::sync::atomic::AtomicU32,

    inflight: Mutex<HashMap<MsgBufId, Box<MessageBuffer>, RandomState>>,
    next_msgbuf_id: AtomicU64,
    rdv: Mutex<RendezvousCache>,
    /// `(key, peer)` -> `(val_len, addr, rkey)` learned from push
    /// requests, reused to target pull-response value writes.
    tensor_info: Mutex<HashMap<(Key, NodeId), (i32, u64, u32), RandomState>>,

    addr_pool: AddressPool<BufferContext>,
    delivery_tx: Sender<(Arc<FabricEndpoint>, Arc<BufferContext>, u32)>,
    delivery_rx: Receiver<(Arc<FabricEndpoint>, Arc<BufferContext>, u32)>,

    endpoints: DashMap<NodeId, Arc<FabricEndpoint>, RandomState>,
    transports: DashMap<NodeId, Arc<crate::transport::Transport>, RandomState>,

    my_node: Mutex<Node>,
    should_stop: AtomicBool,
}

impl FabricShared {
    fn register_wr(
        &self,
        kind: CtxKind,
        node_id: NodeId,
        buf: Option<PoolBuf>,
    ) -> Arc<FabricWrContext> {
        let id = self.next_wr_id.fetch_add(1, Ordering::Relaxed);
        let ctx = Arc::new(FabricWrContext {
            _fi_ctx: [0; 4],
            id,
            kind,
            node_id,
            buf,
            cookie: AtomicU64::new(0),
        });
        self.wr_table.insert(id, ctx.clone());
        ctx
    }

    fn wr(&self, id: CtxHandle) -> Arc<FabricWrContext> {
        self.wr_table
            .get(&id)
            .expect("completion for unknown fabric context")
            .clone()
    }

    fn insert_inflight(&self, msg_buf: MessageBuffer) -> MsgBufId {
        let id = self.next_msgbuf_id.fetch_add(1, Ordering::Relaxed);
        self.inflight.lock().unwrap().insert(id, Box::new(msg_buf));
        id
    }

    fn inflight_ref(&self, id: MsgBufId) -> &MessageBuffer {
        let map = self.inflight.lock().unwrap();
        let ptr_ =
            &**map.get(&id).expect("unknown in-flight message buffer") as *const MessageBuffer;
        // SAFETY: entries are removed only by the write completion.
        unsafe { &*ptr_ }
    }

    fn endpoint(&self, node_id: NodeId) -> Arc<FabricEndpoint> {
        self.endpoints
            .get(&node_id)
            .unwrap_or_else(|| panic!("no fabric endpoint for node {}", node_id))
            .clone()
    }

    /// Retry a data-plane post while the provider reports EAGAIN.
    fn post(&self, mut op: impl FnMut() -> isize, call: &'static str) {
        loop {
            let ret = op();
            if ret == 0 {
                return;
            }
            if ret == -(FI_EAGAIN as isize) {
                thread::yield_now();
                continue;
            }
            check(ret as i32, call);
        }
    }

    /// Arm one tagged receive for control frames.
    fn post_recv(&self, ctx: &Arc<FabricWrContext>) {
        let buf = ctx.buf.as_ref().expect("receive context has no buffer");
        let desc = self.pool.local_desc(buf.as_ptr());
        let trecv = fi_op!((*self.ctx.ep).tagged, trecv);
        let raw = Arc::as_ptr(ctx) as *mut libc::c_void;
        self.post(
            || {
                // SAFETY: live endpoint; chunk and context stay alive in
                // the tables until shutdown.
                unsafe {
                    trecv(
                        self.ctx.ep,
                        buf.as_ptr() as *mut libc::c_void,
                        CHUNK_SIZE,
                        desc,
                        FI_ADDR_UNSPEC as fi_addr_t,
                        TAG_CONTROL,
                        TAG_CONTROL - 1,
                        raw,
                    )
                }
            },
            "fi_trecv",
        );
    }

    fn post_control(&self, ep: &FabricEndpoint, ctx: &Arc<FabricWrContext>, len: usize, imm: Imm) {
        let buf = ctx.buf.as_ref().expect("send context has no buffer");
        let desc = self.pool.local_desc(buf.as_ptr());
        let tsend = fi_op!((*self.ctx.ep).tagged, tsend);
        let raw = Arc::as_ptr(ctx) as *mut libc::c_void;
        let tag = control_tag(self.my_node.lock().unwrap().id, imm);
        self.post(
            || {
                // SAFETY: as in `post_recv`.
                unsafe {
                    tsend(
                        self.ctx.ep,
                        buf.as_ptr() as *const libc::c_void,
                        len,
                        desc,
                        ep.fi_addr,
                        tag,
                        raw,
                    )
                }
            },
            "fi_tsend",
        );
    }
}

/// The fabric data path for one peer. Same contract as the verbs arm.
pub(crate) struct FabricTransport {
    shared: Arc<FabricShared>,
    ep: Arc<FabricEndpoint>,
    is_server: bool,
    pagesize: usize,
}

impl FabricTransport {
    fn new(shared: Arc<FabricShared>, ep: Arc<FabricEndpoint>) -> Self {
        Self {
            shared,
            ep,
            is_server: env::role() == Role::Server,
            pagesize: page_size(),
        }
    }

    pub fn register_memory(&self, msg: &Message) {
        for seg in msg.data.iter().filter(|s| !s.is_empty()) {
            self.shared.mr_cache.ensure_registered(seg.as_ptr(), seg.len());
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
            let mr = self.shared.mr_cache.get(vals.as_ptr());
            msg.meta.addr = vals.as_ptr() as u64;
            msg.meta.val_len = vals.len() as i32;
            // The wire format has 32 key bits; EFA keys fit.
            msg.meta.option = mr.key as u32;
        }
    }

    pub fn prepare_data(&self, msg: &Message, msg_buf: &mut MessageBuffer) {
        if msg.kind() != MsgKind::PushRequest {
            return;
        }
        for seg in msg_buf.data.iter().filter(|s| !s.is_empty()) {
            let mr = self.shared.mr_cache.get(seg.as_ptr());
            msg_buf.mrs.push(crate::mempool::MrEntry {
                mr: ptr::null_mut(),
                len: mr.len,
                lkey: 0,
                rkey: mr.key as u32,
            });
        }
    }

    pub fn send_rendezvous_begin(&self, msg: &Message, id: MsgBufId) {
        let msg_buf = self.shared.inflight_ref(id);
        msg_buf.reserve_write_ctx(self.ep.free_write.pop());

        let ctx = self.shared.wr(self.ep.free_start.pop());

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
                ctx.buf.as_ref().unwrap().as_ptr(),
                mem::size_of::<RendezvousStart>(),
            )
        };
        self.shared.post_control(
            &self.ep,
            &ctx,
            mem::size_of::<RendezvousStart>(),
            IMM_RENDEZVOUS_START,
        );
    }

    pub fn send_rendezvous_reply(&self, req: RendezvousStart) {
        let meta_len = req.meta_len as usize;
        assert!(meta_len <= self.pagesize, "packed meta exceeds one page");

        let data_num = req.data_num as usize;
        let mut data_len = [0usize; MAX_DATA_FIELDS];
        let mut data_total = 0usize;
        for i in 0..data_num {
            data_len[i] = req.data_len[i] as usize;
            data_total += data_len[i];
        }

        let buf_len = if self.is_server {
            self.pagesize + data_total
        } else {
            self.pagesize
        };
        let buffer = self.shared.pool.alloc(buf_len);
        let addr = buffer.as_ptr() as u64;
        let rkey = self.shared.pool.remote_key(buffer.as_ptr());

        let bc = Arc::new(BufferContext {
            buffer,
            meta_len,
            data_num,
            data_len,
        });
        let idx = self.shared.addr_pool.store(bc);

        let ctx = self.shared.wr(self.ep.free_reply.pop());
        let resp = RendezvousReply {
            addr,
            origin_addr: req.origin_addr,
            rkey: rkey as u32,
            idx,
        };
        // SAFETY: the chunk is CHUNK_SIZE >= size_of::<RendezvousReply>().
        unsafe {
            ptr::copy_nonoverlapping(
                resp.as_bytes().as_ptr(),
                ctx.buf.as_ref().unwrap().as_ptr(),
                mem::size_of::<RendezvousReply>(),
            )
        };
        self.shared.post_control(
            &self.ep,
            &ctx,
            mem::size_of::<RendezvousReply>(),
            IMM_RENDEZVOUS_REPLY,
        );
    }

    pub fn write_with_imm(&self, id: MsgBufId, remote: RemoteTuple) {
        let (raddr, rkey, idx) = remote;
        let msg_buf = self.shared.inflight_ref(id);

        let ctx = match msg_buf.take_write_ctx() {
            Some(h) => self.shared.wr(h),
            None => self.shared.wr(self.ep.free_write.pop()),
        };
        ctx.cookie.store(id, Ordering::Release);

        if msg_buf.mrs.len() == 3 {
            let vals = &msg_buf.data[1];
            let mr = self.shared.mr_cache.get(vals.as_ptr());
            let write = fi_op!((*self.shared.ctx.ep).rma, write);
            let dest = raddr + align_ceil(msg_buf.inline_len, self.pagesize) as u64;
            self.shared.post(
                || {
                    // SAFETY: registered source, peer-granted destination.
                    unsafe {
                        write(
                            self.shared.ctx.ep,
                            vals.as_ptr() as *const libc::c_void,
                            vals.len(),
                            mr.desc,
                            self.ep.fi_addr,
                            dest,
                            rkey as u64,
                            ptr::null_mut(),
                        )
                    }
                },
                "fi_write",
            );
        } else {
            assert!(msg_buf.mrs.is_empty(), "unexpected MR count");
        }

        let desc = self.shared.pool.local_desc(msg_buf.inline_buf.as_ptr());
        let writedata = fi_op!((*self.shared.ctx.ep).rma, writedata);
        let raw = Arc::as_ptr(&ctx) as *mut libc::c_void;
        self.shared.post(
            || {
                // SAFETY: as above; the slot index rides as CQ data.
                unsafe {
                    writedata(
                        self.shared.ctx.ep,
                        msg_buf.inline_buf.as_ptr() as *const libc::c_void,
                        msg_buf.inline_len,
                        desc,
                        idx as u64,
                        self.ep.fi_addr,
                        raddr,
                        rkey as u64,
                        raw,
                    )
                }
            },
            "fi_writedata",
        );
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

    pub fn send_pull_response(&self, msg: &Message, id: MsgBufId, remote: RemoteTuple) {
        let msg_buf = self.shared.inflight_ref(id);
        let vals = &msg_buf.data[1];
        let mr = self.shared.mr_cache.get(vals.as_ptr());
        let write = fi_op!((*self.shared.ctx.ep).rma, write);
        let raddr = msg.meta.addr;
        let rkey = msg.meta.option as u64;
        self.shared.post(
            || {
                // SAFETY: registered source; the worker granted `raddr`.
                unsafe {
                    write(
                        self.shared.ctx.ep,
                        vals.as_ptr() as *const libc::c_void,
                        vals.len(),
                        mr.desc,
                        self.ep.fi_addr,
                        raddr,
                        rkey,
                        ptr::null_mut(),
                    )
                }
            },
            "fi_write",
        );
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

/// The fabric van: same public surface as [`crate::Van`], addressed by
/// endpoint names instead of host/port.
pub struct FabricVan {
    shared: Arc<FabricShared>,
    cq_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl FabricVan {
    pub fn new() -> Self {
        let ctx = FabricContext::init();
        let pool = FabricPool::new(ctx.domain);
        let mr_cache = FabricMrCache {
            domain: ctx.domain,
            map: DashMap::with_hasher(RandomState::new()),
        };
        let (delivery_tx, delivery_rx) = unbounded();
        let shared = Arc::new(FabricShared {
            ctx,
            pool,
            mr_cache,
            wr_table: DashMap::with_hasher(RandomState::new()),
            next_wr_id: std::sync::atomic::AtomicU32::new(1),
            inflight: Mutex::new(HashMap::with_hasher(RandomState::new())),
            next_msgbuf_id: AtomicU64::new(1),
            rdv: Mutex::new(RendezvousCache::default()),
            tensor_info: Mutex::new(HashMap::with_hasher(RandomState::new())),
            addr_pool: AddressPool::new(),
            delivery_tx,
            delivery_rx,
            endpoints: DashMap::with_hasher(RandomState::new()),
            transports: DashMap::with_hasher(RandomState::new()),
            my_node: Mutex::new(Node::new(Node::EMPTY, env::role(), "", 0)),
            should_stop: AtomicBool::new(false),
        });
        Self {
            shared,
            cq_thread: Mutex::new(None),
        }
    }

    /// Local endpoint name to ship over the bootstrap channel.
    pub fn endpoint_name(&self) -> Vec<u8> {
        self.shared.ctx.addr[..self.shared.ctx.addr_len].to_vec()
    }

    pub fn start(&self, customer_id: i32) {
        let level = if env::rdma_log_enabled() {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        };
        let _ = simple_logger::SimpleLogger::new().with_level(level).init();

        self.shared.should_stop.store(false, Ordering::SeqCst);

        // Control-frame receive ring.
        for _ in 0..RX_DEPTH {
            let buf = self.shared.pool.alloc(CHUNK_SIZE);
            let ctx = self
                .shared
                .register_wr(CtxKind::Receive, Node::EMPTY, Some(buf));
            self.shared.post_recv(&ctx);
        }

        let shared = self.shared.clone();
        *self.cq_thread.lock().unwrap() = Some(
            thread::Builder::new()
                .name("fabric-cq-poller".into())
                .spawn(move || fabric_cq_loop(shared))
                .expect("failed to spawn the fabric CQ poller"),
        );
        log::debug!("fabric van started for customer {}", customer_id);
    }

    pub fn stop(&self) {
        self.shared.should_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.cq_thread.lock().unwrap().take() {
            handle.join().expect("fabric CQ poller panicked");
        }
        self.shared.transports.clear();
        self.shared.endpoints.clear();
        self.shared.wr_table.clear();
        self.shared.addr_pool.clear();
        self.shared.inflight.lock().unwrap().clear();
    }

    /// No listener to set up: the endpoint name is the address.
    pub fn bind(&self, node: &Node, _max_retry: usize) -> i32 {
        *self.shared.my_node.lock().unwrap() = node.clone();
        node.port
    }

    /// Insert the peer's endpoint name into the address vector.
    pub fn connect(&self, node: &Node) {
        assert_ne!(node.id, Node::EMPTY, "cannot connect to an empty node");
        assert!(
            !node.endpoint_name.is_empty(),
            "fabric connect needs an endpoint name"
        );

        let my_node = self.shared.my_node.lock().unwrap().clone();
        if node.role == my_node.role && node.id != my_node.id {
            return;
        }

        let fi_addr = self.shared.ctx.av_insert(&node.endpoint_name);
        let ep = Arc::new(FabricEndpoint {
            node_id: node.id,
            fi_addr,
            free_start: FreeList::new(START_DEPTH),
            free_reply: FreeList::new(REPLY_DEPTH),
            free_write: FreeList::new(WRITE_DEPTH),
        });

        for _ in 0..START_DEPTH {
            let buf = self.shared.pool.alloc(CHUNK_SIZE);
            let ctx = self
                .shared
                .register_wr(CtxKind::RendezvousStart, node.id, Some(buf));
            ep.free_start.push(ctx.id);
        }
        for _ in 0..REPLY_DEPTH {
            let buf = self.shared.pool.alloc(CHUNK_SIZE);
            let ctx = self
                .shared
                .register_wr(CtxKind::RendezvousReply, node.id, Some(buf));
            ep.free_reply.push(ctx.id);
        }
        for _ in 0..WRITE_DEPTH {
            let ctx = self.shared.register_wr(CtxKind::Write, node.id, None);
            ep.free_write.push(ctx.id);
        }

        self.shared.endpoints.insert(node.id, ep.clone());
        let trans = Arc::new(crate::transport::Transport::Fabric(FabricTransport::new(
            self.shared.clone(),
            ep,
        )));
        self.shared.transports.insert(node.id, trans);
        log::debug!("fabric connected to node {}", node.id);
    }

    pub fn send_msg(&self, msg: &mut Message) -> usize {
        let remote_id = msg.meta.recver;
        assert_ne!(remote_id, Node::EMPTY, "message has no receiver");
        let trans = self
            .shared
            .transports
            .get(&remote_id)
            .unwrap_or_else(|| panic!("no fabric transport for node {}", remote_id))
            .clone();

        msg.meta.sender = self.shared.my_node.lock().unwrap().id;

        trans.register_memory(msg);
        if msg.is_valid_pushpull() {
            trans.add_meta(msg);
            if msg.kind() == MsgKind::PullResponse {
                let info_map = self.shared.tensor_info.lock().unwrap();
                let &(val_len, addr, rkey) = info_map
                    .get(&(msg.meta.key, msg.meta.recver))
                    .unwrap_or_else(|| {
                        panic!(
                            "no tensor address for key={} recver={}",
                            msg.meta.key, msg.meta.recver
                        )
                    });
                msg.meta.val_len = val_len;
                msg.meta.addr = addr;
                msg.meta.option = rkey;
            }
        }

        let inline_len = msg.meta.packed_len();
        let inline_buf = self.shared.pool.alloc(inline_len);
        // SAFETY: the pool handed us at least `inline_len` bytes.
        msg.meta.pack(unsafe {
            std::slice::from_raw_parts_mut(inline_buf.as_ptr(), inline_buf.len())
        });
        let total_len = inline_len + msg.data_size();

        let mut msg_buf = MessageBuffer::new(inline_buf, inline_len, msg.data.clone());
        trans.prepare_data(msg, &mut msg_buf);
        let id = self.shared.insert_inflight(msg_buf);

        if !msg.is_valid_pushpull() {
            trans.send_rendezvous_begin(msg, id);
            return total_len;
        }

        let remote = {
            let mut rdv = self.shared.rdv.lock().unwrap();
            rdv.lookup_or_memoize(id, msg.meta.key, msg.meta.push, remote_id)
        };
        let remote = match remote {
            Some(remote) => remote,
            None => {
                trans.send_rendezvous_begin(msg, id);
                return total_len;
            }
        };

        match msg.kind() {
            MsgKind::PushRequest => trans.send_push_request(msg, id, remote),
            MsgKind::PushResponse => trans.send_push_response(msg, id, remote),
            MsgKind::PullRequest => trans.send_pull_request(msg, id, remote),
            MsgKind::PullResponse => trans.send_pull_response(msg, id, remote),
            MsgKind::Control => unreachable!(),
        }
        total_len
    }

    pub fn recv_msg(&self, msg: &mut Message) -> usize {
        msg.data.clear();

        let (ep, bc, idx) = self
            .shared
            .delivery_rx
            .recv()
            .expect("delivery queue closed");

        // SAFETY: the slot buffer holds at least one packed meta.
        let buf = unsafe { std::slice::from_raw_parts(bc.buffer.as_ptr(), bc.buffer.len()) };
        msg.meta = Meta::unpack(buf);
        msg.meta.recver = self.shared.my_node.lock().unwrap().id;
        msg.meta.sender = ep.node_id;

        let meta_len = msg.meta.packed_len();
        let mut total_len = meta_len;

        if !msg.is_valid_pushpull() {
            self.shared.addr_pool.release(idx);
            return total_len;
        }

        let trans = self
            .shared
            .transports
            .get(&ep.node_id)
            .expect("peer has no transport")
            .clone();
        match msg.kind() {
            MsgKind::PushRequest => {
                total_len += trans.recv_push_request(msg, &bc);
                self.shared
                    .tensor_info
                    .lock()
                    .unwrap()
                    .insert(
                        (msg.meta.key, msg.meta.sender),
                        (msg.meta.val_len, msg.meta.addr, msg.meta.option),
                    );
            }
            MsgKind::PushResponse => total_len += trans.recv_push_response(msg, &bc),
            MsgKind::PullRequest => total_len += trans.recv_pull_request(msg, &bc),
            MsgKind::PullResponse => total_len += trans.recv_pull_response(msg, &bc),
            MsgKind::Control => unreachable!(),
        }
        total_len
    }
}

impl Default for FabricVan {
    fn default() -> Self {
        Self::new()
    }
}

/// Tagged-CQ poll loop.
fn fabric_cq_loop(shared: Arc<FabricShared>) {
    const BATCH: usize = 64;
    let mut entries: Vec<fi_cq_tagged_entry> = (0..BATCH)
        // SAFETY: POD completion entries, overwritten by the read.
        .map(|_| unsafe { mem::zeroed() })
        .collect();

    let read = fi_op!((*shared.ctx.cq).ops, read);
    let readerr = fi_op!((*shared.ctx.cq).ops, readerr);

    while !shared.should_stop.load(Ordering::Relaxed) {
        // SAFETY: live CQ and a correctly-sized entry array.
        let n = unsafe {
            read(
                shared.ctx.cq,
                entries.as_mut_ptr() as *mut libc::c_void,
                BATCH,
            )
        };
        if n == -(FI_EAGAIN as isize) {
            continue;
        }
        if n == -(FI_EAVAIL as isize) {
            // SAFETY: POD error entry.
            let mut err: fi_cq_err_entry = unsafe { mem::zeroed() };
            // SAFETY: the CQ reported an error entry available.
            unsafe { readerr(shared.ctx.cq, &mut err, 0) };
            panic!(
                "fabric completion failed: err={} prov_errno={}",
                err.err, err.prov_errno
            );
        }
        assert!(n >= 0, "fi_cq_read failed: {}", n);

        for entry in &entries[..n as usize] {
            handle_fabric_completion(&shared, entry);
        }
    }
}

fn handle_fabric_completion(shared: &Arc<FabricShared>, entry: &fi_cq_tagged_entry) {
    let flags = entry.flags;

    // Data arrival: the peer's writedata delivered a slot index.
    if flags & FI_REMOTE_CQ_DATA as u64 != 0 && flags & FI_RECV as u64 == 0 {
        let idx = entry.data as u32;
        let bc = shared.addr_pool.get(idx);
        // Slot indices identify the sender through the rendezvous; the
        // endpoint is recovered from the pending transport map there.
        deliver(shared, bc, idx);
        return;
    }

    let ctx = {
        assert!(!entry.op_context.is_null(), "completion without context");
        // SAFETY: op contexts are addresses of live FabricWrContexts.
        let raw = unsafe { &*(entry.op_context as *const FabricWrContext) };
        shared.wr(raw.id)
    };

    if flags & FI_RECV as u64 != 0 {
        if flags & FI_REMOTE_CQ_DATA as u64 != 0 {
            // Remote CQ data consumed a posted receive on this provider.
            let idx = entry.data as u32;
            let bc = shared.addr_pool.get(idx);
            deliver(shared, bc, idx);
        } else {
            assert!(entry.tag & TAG_CONTROL != 0, "untagged control frame");
            let (src, imm) = control_tag_parts(entry.tag);
            let buf_ptr = ctx.buf.as_ref().unwrap().as_ptr();
            dispatch_control(shared, src, imm, buf_ptr);
        }
        shared.post_recv(&ctx);
        return;
    }

    if flags & FI_SEND as u64 != 0 {
        release_fabric_ctx(shared, &ctx);
        return;
    }

    if flags & FI_WRITE as u64 != 0 {
        let id = ctx.cookie.swap(0, Ordering::AcqRel);
        let removed = shared.inflight.lock().unwrap().remove(&id);
        debug_assert!(removed.is_some());
        release_fabric_ctx(shared, &ctx);
        return;
    }

    panic!("unexpected fabric completion flags {:#x}", flags);
}

fn dispatch_control(shared: &Arc<FabricShared>, src: NodeId, imm: Imm, buf_ptr: *mut u8) {
    let trans = shared
        .transports
        .get(&src)
        .unwrap_or_else(|| panic!("control frame from unknown peer {}", src))
        .clone();
    match imm {
        IMM_RENDEZVOUS_START => {
            // SAFETY: the peer sent a whole frame into this chunk.
            let req = unsafe { RendezvousStart::read_from(buf_ptr) };
            trans.send_rendezvous_reply(req);
        }
        IMM_RENDEZVOUS_REPLY => {
            // SAFETY: as above.
            let resp = unsafe { RendezvousReply::read_from(buf_ptr) };
            let remote = (resp.addr, resp.rkey, resp.idx);
            shared.rdv.lock().unwrap().store(resp.origin_addr, remote);
            trans.write_with_imm(resp.origin_addr, remote);
        }
        imm => panic!("unknown rendezvous immediate {}", imm),
    }
}

fn deliver(shared: &Arc<FabricShared>, bc: Arc<BufferContext>, idx: u32) {
    // SAFETY: the slot buffer holds at least one packed meta.
    let buf = unsafe { std::slice::from_raw_parts(bc.buffer.as_ptr(), bc.buffer.len()) };
    let sender = Meta::unpack(buf).sender;
    let ep = shared
        .endpoints
        .get(&sender)
        .map(|e| e.clone())
        .unwrap_or_else(|| {
            Arc::new(FabricEndpoint {
                node_id: sender,
                fi_addr: FI_ADDR_UNSPEC as fi_addr_t,
                free_start: FreeList::new(1),
                free_reply: FreeList::new(1),
                free_write: FreeList::new(1),
            })
        });
    shared
        .delivery_tx
        .send((ep, bc, idx))
        .expect("delivery queue closed");
}

fn release_fabric_ctx(shared: &Arc<FabricShared>, ctx: &Arc<FabricWrContext>) {
    if ctx.node_id == Node::EMPTY {
        return;
    }
    let ep = shared.endpoint(ctx.node_id);
    match ctx.kind {
        CtxKind::RendezvousStart => ep.free_start.push(ctx.id),
        CtxKind::RendezvousReply => ep.free_reply.push(ctx.id),
        CtxKind::Write => ep.free_write.push(ctx.id),
        CtxKind::Receive => unreachable!("receive contexts re-arm in the poller"),
    }
}
