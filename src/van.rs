//! The van: connection management and message orchestration.
//!
//! Owns every long-lived resource (endpoints, pools, caches, pollers)
//! and stitches socket-style discovery onto RDMA queue-pair setup via
//! the CM event channel. Two threads drive the transport: a CM-event
//! poller handling connection lifecycle, and a latency-critical CQ
//! poller dispatching work completions.

use std::collections::HashMap;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ahash::RandomState;
use crossbeam::channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use rand::Rng;
use rdma_sys::*;

use crate::addrpool::AddressPool;
use crate::endpoint::{ConnStatus, CtxKind, CtxTable, Endpoint, WrContext};
use crate::error::Error;
use crate::mempool::{MemPool, MrCache, PoolBuf};
use crate::message::{Message, Meta, MsgKind, Node};
use crate::msgbuf::MessageBuffer;
use crate::transport::{IpcTransport, RdmaTransport, Transport};
use crate::type_alias::*;
use crate::util::env;
use crate::wire::*;

/// Remote write destination: `(remote addr, rkey, receive-slot index)`.
pub(crate) type RemoteTuple = (u64, RKey, u32);

/// Metadata of one inbound message slot. Created on rendezvous start,
/// filled by every subsequent write-with-immediate carrying its index.
pub(crate) struct BufferContext {
    pub buffer: PoolBuf,
    pub meta_len: usize,
    pub data_num: usize,
    pub data_len: [usize; MAX_DATA_FIELDS],
}

/// A filled inbound slot, queued for `recv_msg`.
type Delivery = (Arc<Endpoint>, Arc<BufferContext>, u32);

/// Remote-address memo: per-(key, peer) destination learned from the
/// first rendezvous, separately per direction, plus the in-flight
/// memoization that routes a rendezvous reply back to its cache entry.
/// Callers hold one lock over the whole struct: the check in
/// `lookup_or_memoize` and the insert in `store` must observe each
/// other atomically.
#[derive(Default)]
pub(crate) struct RendezvousCache {
    push: HashMap<(Key, NodeId), RemoteTuple>,
    pull: HashMap<(Key, NodeId), RemoteTuple>,
    pending: HashMap<MsgBufId, (Key, bool, NodeId)>,
}

impl RendezvousCache {
    /// Cached remote tuple for `(key, peer, direction)`; on a miss,
    /// memoize the cookie so the rendezvous reply can fill the cache.
    pub(crate) fn lookup_or_memoize(
        &mut self,
        id: MsgBufId,
        key: Key,
        is_push: bool,
        recver: NodeId,
    ) -> Option<RemoteTuple> {
        let map = if is_push { &self.push } else { &self.pull };
        if let Some(&tuple) = map.get(&(key, recver)) {
            return Some(tuple);
        }
        self.pending.insert(id, (key, is_push, recver));
        None
    }

    /// Record the destination a rendezvous reply announced. Control
    /// messages have no memo entry and stay uncached.
    pub(crate) fn store(&mut self, id: MsgBufId, tuple: RemoteTuple) {
        if let Some((key, is_push, recver)) = self.pending.remove(&id) {
            let map = if is_push {
                &mut self.push
            } else {
                &mut self.pull
            };
            map.insert((key, recver), tuple);
        }
    }
}

/// Worker tensor address learned from a push request, reused to target
/// pull-response value writes.
#[derive(Clone, Copy, PartialEq, Eq)]
struct TensorInfo {
    val_len: i32,
    addr: u64,
    rkey: u32,
}

/// State shared between the van, its transports and its pollers.
pub(crate) struct Shared {
    pub ctx_table: CtxTable,
    pub addr_pool: AddressPool<BufferContext>,

    /// In-flight message buffers, keyed by the cookie that travels in
    /// the rendezvous frames and write contexts.
    inflight: Mutex<HashMap<MsgBufId, Box<MessageBuffer>, RandomState>>,
    next_msgbuf_id: AtomicU64,

    rdv: Mutex<RendezvousCache>,
    tensor_info: Mutex<HashMap<(Key, NodeId), TensorInfo, RandomState>>,

    send_pool: Mutex<Option<Arc<MemPool>>>,
    recv_pool: Mutex<Option<Arc<MemPool>>>,
    mr_cache: Mutex<Option<Arc<MrCache>>>,

    pd: AtomicPtr<ibv_pd>,
    cq: AtomicPtr<ibv_cq>,

    delivery_tx: Sender<Delivery>,
    delivery_rx: Receiver<Delivery>,

    /// Outgoing endpoints, keyed by peer node id.
    endpoints: DashMap<NodeId, Arc<Endpoint>, RandomState>,
    /// Accepted endpoints, owned until shutdown.
    incoming: Mutex<Vec<Arc<Endpoint>>>,
    /// Per-endpoint transports, keyed by endpoint identity.
    transports: DashMap<usize, Arc<Transport>, RandomState>,
    /// CM id -> endpoint, resolved by the CM-event poller.
    cm_ids: DashMap<usize, Arc<Endpoint>, RandomState>,

    is_local: DashMap<NodeId, bool, RandomState>,

    my_node: Mutex<Node>,
    cq_thread: Mutex<Option<thread::JoinHandle<()>>>,
    should_stop: AtomicBool,
}

impl Shared {
    pub(crate) fn new() -> Arc<Self> {
        let (delivery_tx, delivery_rx) = unbounded();
        Arc::new(Self {
            ctx_table: CtxTable::new(),
            addr_pool: AddressPool::new(),
            inflight: Mutex::new(HashMap::with_hasher(RandomState::new())),
            next_msgbuf_id: AtomicU64::new(1),
            rdv: Mutex::new(RendezvousCache::default()),
            tensor_info: Mutex::new(HashMap::with_hasher(RandomState::new())),
            send_pool: Mutex::new(None),
            recv_pool: Mutex::new(None),
            mr_cache: Mutex::new(None),
            pd: AtomicPtr::new(ptr::null_mut()),
            cq: AtomicPtr::new(ptr::null_mut()),
            delivery_tx,
            delivery_rx,
            endpoints: DashMap::with_hasher(RandomState::new()),
            incoming: Mutex::new(Vec::new()),
            transports: DashMap::with_hasher(RandomState::new()),
            cm_ids: DashMap::with_hasher(RandomState::new()),
            is_local: DashMap::with_hasher(RandomState::new()),
            my_node: Mutex::new(Node::new(Node::EMPTY, env::role(), "", 0)),
            cq_thread: Mutex::new(None),
            should_stop: AtomicBool::new(false),
        })
    }

    pub(crate) fn send_pool(&self) -> Arc<MemPool> {
        self.send_pool
            .lock()
            .unwrap()
            .clone()
            .expect("send pool not initialized")
    }

    pub(crate) fn recv_pool(&self) -> Arc<MemPool> {
        self.recv_pool
            .lock()
            .unwrap()
            .clone()
            .expect("recv pool not initialized")
    }

    pub(crate) fn mr_cache(&self) -> Arc<MrCache> {
        self.mr_cache
            .lock()
            .unwrap()
            .clone()
            .expect("MR cache not initialized")
    }

    /// Lazily set up PD, CQ and pools from the first CM id that carries
    /// a verbs context.
    fn init_context(&self, context: *mut ibv_context) {
        let mut send_pool = self.send_pool.lock().unwrap();
        if send_pool.is_some() {
            return;
        }
        assert!(!context.is_null(), "CM id carries no verbs context");

        // SAFETY: `context` is a live device context owned by the CM.
        let pd = unsafe { ibv_alloc_pd(context) };
        assert!(!pd.is_null(), "failed to allocate protection domain");

        // SAFETY: live context; no completion channel, the poller spins.
        let cq = unsafe {
            ibv_create_cq(
                context,
                (MAX_CONCURRENT_WR * 2) as i32,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            )
        };
        assert!(!cq.is_null(), "failed to create completion queue");

        self.pd.store(pd, Ordering::Release);
        self.cq.store(cq, Ordering::Release);

        *send_pool = Some(MemPool::new(pd));
        *self.recv_pool.lock().unwrap() = Some(MemPool::new(pd));
        *self.mr_cache.lock().unwrap() = Some(MrCache::new(pd));
    }

    fn pd(&self) -> *mut ibv_pd {
        self.pd.load(Ordering::Acquire)
    }

    fn cq_ptr(&self) -> *mut ibv_cq {
        self.cq.load(Ordering::Acquire)
    }

    /// Register an in-flight message buffer, returning its cookie.
    fn insert_inflight(&self, msg_buf: MessageBuffer) -> MsgBufId {
        let id = self.next_msgbuf_id.fetch_add(1, Ordering::Relaxed);
        self.inflight.lock().unwrap().insert(id, Box::new(msg_buf));
        id
    }

    /// Borrow an in-flight message buffer by cookie.
    pub(crate) fn inflight_ref(&self, id: MsgBufId) -> &MessageBuffer {
        let map = self.inflight.lock().unwrap();
        let ptr = &**map.get(&id).expect("unknown in-flight message buffer")
            as *const MessageBuffer;
        // SAFETY: the entry is removed only by the write completion,
        // which cannot run before the write referencing it is posted.
        unsafe { &*ptr }
    }

    fn remove_inflight(&self, id: MsgBufId) {
        let removed = self.inflight.lock().unwrap().remove(&id);
        debug_assert!(removed.is_some(), "write completion without message buffer");
    }

    /// Cached remote tuple lookup; see [`RendezvousCache`].
    pub(crate) fn has_remote_info(
        &self,
        id: MsgBufId,
        key: Key,
        is_push: bool,
        recver: NodeId,
    ) -> Option<RemoteTuple> {
        self.rdv
            .lock()
            .unwrap()
            .lookup_or_memoize(id, key, is_push, recver)
    }

    /// Record the destination a rendezvous reply announced.
    pub(crate) fn store_remote_info(&self, id: MsgBufId, tuple: RemoteTuple) {
        self.rdv.lock().unwrap().store(id, tuple);
    }

    fn transport_for(&self, ep: &Arc<Endpoint>) -> Arc<Transport> {
        self.transports
            .get(&(Arc::as_ptr(ep) as usize))
            .expect("endpoint has no transport")
            .clone()
    }

    fn set_transport(&self, ep: &Arc<Endpoint>, trans: Arc<Transport>) {
        self.transports.insert(Arc::as_ptr(ep) as usize, trans);
    }

    /// Drop an endpoint's table entries and transport.
    fn remove_endpoint(&self, ep: &Arc<Endpoint>) {
        for id in ep.take_ctx_ids() {
            self.ctx_table.remove(id);
        }
        self.transports.remove(&(Arc::as_ptr(ep) as usize));
        self.cm_ids.remove(&(ep.cm_id() as usize));
    }

    fn make_transport(self: &Arc<Self>, ep: Arc<Endpoint>, pool: Arc<MemPool>, local: bool) {
        let rdma = RdmaTransport::new(self.clone(), ep.clone(), pool);
        let trans = if local {
            Arc::new(Transport::Ipc(IpcTransport::new(rdma)))
        } else {
            Arc::new(Transport::Rdma(rdma))
        };
        self.set_transport(&ep, trans);
    }
}

/// The RDMA van.
///
/// `start` must run before `bind`/`connect`: it creates the CM event
/// channel and its poller. `send_msg` is not thread-safe for the same
/// destination unless callers serialize; internal contention is
/// resolved by the free-lists and cache locks.
pub struct Van {
    shared: Arc<Shared>,
    event_channel: AtomicPtr<rdma_event_channel>,
    listener: AtomicPtr<rdma_cm_id>,
    cm_thread: Mutex<Option<thread::JoinHandle<()>>>,
    disable_ipc: AtomicBool,
}

impl Van {
    pub fn new() -> Self {
        // Fork safety must be requested before the first verbs call.
        // SAFETY: FFI, no arguments.
        let rc = unsafe { ibv_fork_init() };
        assert_eq!(rc, 0, "ibv_fork_init failed");

        Self {
            shared: Shared::new(),
            event_channel: AtomicPtr::new(ptr::null_mut()),
            listener: AtomicPtr::new(ptr::null_mut()),
            cm_thread: Mutex::new(None),
            disable_ipc: AtomicBool::new(true),
        }
    }

    /// Spin up the CM event machinery.
    pub fn start(&self, customer_id: i32) {
        let level = if env::rdma_log_enabled() {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        };
        // The embedding framework's logger wins if one is installed.
        let _ = simple_logger::SimpleLogger::new().with_level(level).init();

        self.shared.should_stop.store(false, Ordering::SeqCst);

        let disable_ipc = !env::ipc_enabled();
        self.disable_ipc.store(disable_ipc, Ordering::SeqCst);
        if disable_ipc {
            log::info!("shared memory IPC has been disabled");
        }

        if self.event_channel.load(Ordering::Acquire).is_null() {
            // SAFETY: FFI.
            let channel = unsafe { rdma_create_event_channel() };
            assert!(!channel.is_null(), "failed to create CM event channel");
            self.event_channel.store(channel, Ordering::Release);

            let shared = self.shared.clone();
            let channel_addr = channel as usize;
            let handle = thread::Builder::new()
                .name("cm-poller".into())
                .spawn(move || cm_event_loop(shared, channel_addr as *mut rdma_event_channel))
                .expect("failed to spawn the CM poller");
            *self.cm_thread.lock().unwrap() = Some(handle);
        }

        log::debug!("van started for customer {}", customer_id);
    }

    /// Stop both pollers and tear down every verbs resource except the
    /// protection domain.
    pub fn stop(&self) {
        log::debug!("van stopping");

        // Graceful teardown while the CM poller still runs: it flips
        // each endpoint back to IDLE on the DISCONNECTED event.
        for entry in self.shared.endpoints.iter() {
            if entry.value().status() == ConnStatus::Connected {
                entry.value().disconnect();
            }
        }

        self.shared.should_stop.store(true, Ordering::SeqCst);

        if let Some(handle) = self.shared.cq_thread.lock().unwrap().take() {
            handle.join().expect("CQ poller panicked");
        }
        if let Some(handle) = self.cm_thread.lock().unwrap().take() {
            handle.join().expect("CM poller panicked");
        }

        // Transports first: IPC copy workers must drain before their
        // endpoints go away.
        self.shared.transports.clear();

        for entry in self.shared.endpoints.iter() {
            self.shared.remove_endpoint(entry.value());
        }
        self.shared.endpoints.clear();
        for ep in self.shared.incoming.lock().unwrap().drain(..) {
            self.shared.remove_endpoint(&ep);
        }
        self.shared.cm_ids.clear();

        // Release every pool allocation so the slab MRs deregister.
        self.shared.addr_pool.clear();
        self.shared.inflight.lock().unwrap().clear();

        let cq = self.shared.cq.swap(ptr::null_mut(), Ordering::AcqRel);
        if !cq.is_null() {
            // SAFETY: all QPs on this CQ were destroyed above.
            let rc = unsafe { ibv_destroy_cq(cq) };
            assert_eq!(rc, 0, "failed to destroy the completion queue");
        }

        self.shared.send_pool.lock().unwrap().take();
        self.shared.recv_pool.lock().unwrap().take();
        self.shared.mr_cache.lock().unwrap().take();
        // TODO: dealloc the PD once MR teardown is ordered before it.

        let listener = self.listener.swap(ptr::null_mut(), Ordering::AcqRel);
        if !listener.is_null() {
            // SAFETY: created by `bind` and unused once the pollers stopped.
            unsafe { rdma_destroy_id(listener) };
        }
        let channel = self.event_channel.swap(ptr::null_mut(), Ordering::AcqRel);
        if !channel.is_null() {
            // SAFETY: the CM poller has exited.
            unsafe { rdma_destroy_event_channel(channel) };
        }
    }

    /// Listen on `node.port`, retrying random ports on conflicts.
    /// Return the bound port, or -1 when every attempt failed.
    pub fn bind(&self, node: &Node, max_retry: usize) -> i32 {
        match self.try_bind(node, max_retry) {
            Ok(port) => port,
            Err(Error::BindExhausted(_)) => -1,
            Err(e) => panic!("bind failed: {}", e),
        }
    }

    fn try_bind(&self, node: &Node, max_retry: usize) -> Result<i32, Error> {
        let channel = self.event_channel.load(Ordering::Acquire);
        assert!(!channel.is_null(), "start() must run before bind()");

        let mut listener = ptr::null_mut();
        // SAFETY: live event channel.
        let rc = unsafe {
            rdma_create_id(
                channel,
                &mut listener,
                ptr::null_mut(),
                rdma_port_space::RDMA_PS_TCP,
            )
        };
        if rc != 0 {
            return Err(Error::cm("rdma_create_id"));
        }
        self.listener.store(listener, Ordering::Release);

        let bind_ip = match env::node_host() {
            Some(host) => {
                log::debug!("binding to DMLC_NODE_HOST {}", host);
                host.parse().expect("DMLC_NODE_HOST is not an IPv4 address")
            }
            None => Ipv4Addr::UNSPECIFIED,
        };

        let mut rng = rand::thread_rng();
        let mut port = node.port;
        let mut bound = false;
        for _ in 0..=max_retry {
            let mut addr = sockaddr_v4(bind_ip, port as u16);
            // SAFETY: live listener id and a valid sockaddr.
            let rc = unsafe {
                rdma_bind_addr(listener, &mut addr as *mut libc::sockaddr_in as *mut sockaddr)
            };
            if rc == 0 {
                bound = true;
                break;
            }
            port = 10_000 + rng.gen_range(0..40_000);
        }
        if !bound {
            return Err(Error::BindExhausted(max_retry));
        }

        // SAFETY: bound listener.
        let rc = unsafe { rdma_listen(listener, LISTEN_BACKLOG) };
        if rc != 0 {
            return Err(Error::cm("rdma_listen"));
        }

        let mut my_node = self.shared.my_node.lock().unwrap();
        *my_node = node.clone();
        my_node.port = port;
        Ok(port)
    }

    /// Connect to a peer, blocking until the endpoint is CONNECTED.
    /// Rejections and transient address errors back off 500 ms and
    /// retry.
    pub fn connect(&self, node: &Node) {
        log::debug!("connecting to node {}", node.id);
        assert_ne!(node.id, Node::EMPTY, "cannot connect to an empty node");
        assert_ne!(node.port, 0, "cannot connect without a port");
        assert!(!node.hostname.is_empty(), "cannot connect without a host");

        let my_node = self.shared.my_node.lock().unwrap().clone();

        // Workers never talk to workers, nor servers to servers.
        if node.role == my_node.role && node.id != my_node.id {
            return;
        }

        let local = if self.disable_ipc.load(Ordering::SeqCst) {
            false
        } else {
            let local = node.hostname == my_node.hostname;
            if local {
                log::info!("IPC enabled towards node {}", node.id);
            }
            local
        };
        self.shared.is_local.insert(node.id, local);

        if let Some((_, old)) = self.shared.endpoints.remove(&node.id) {
            self.shared.remove_endpoint(&old);
        }

        let ep = Endpoint::new();
        ep.set_node_id(node.id);
        self.shared.endpoints.insert(node.id, ep.clone());

        let remote = resolve_v4(&node.hostname, node.port as u16)
            .unwrap_or_else(|e| panic!("{}", e));

        let channel = self.event_channel.load(Ordering::Acquire);
        assert!(!channel.is_null(), "start() must run before connect()");

        let mut retries = 0usize;
        while ep.status() != ConnStatus::Connected {
            ep.set_status(ConnStatus::Connecting);

            let old_id = ep.cm_id();
            if !old_id.is_null() {
                self.shared.cm_ids.remove(&(old_id as usize));
                // SAFETY: the previous attempt's id; its QP (if any)
                // must go first.
                unsafe {
                    if !(*old_id).qp.is_null() {
                        rdma_destroy_qp(old_id);
                    }
                    rdma_destroy_id(old_id);
                }
                ep.set_cm_id(ptr::null_mut());
            }

            let mut cm_id = ptr::null_mut();
            // SAFETY: live event channel.
            let rc = unsafe {
                rdma_create_id(
                    channel,
                    &mut cm_id,
                    ptr::null_mut(),
                    rdma_port_space::RDMA_PS_TCP,
                )
            };
            assert_eq!(rc, 0, "failed to create a CM id");
            ep.set_cm_id(cm_id);
            self.shared.cm_ids.insert(cm_id as usize, ep.clone());

            let mut dst = sockaddr_v4(
                match remote {
                    SocketAddr::V4(v4) => *v4.ip(),
                    SocketAddr::V6(_) => unreachable!(),
                },
                node.port as u16,
            );

            let rc = match env::node_host() {
                Some(host) => {
                    let src_ip: Ipv4Addr =
                        host.parse().expect("DMLC_NODE_HOST is not an IPv4 address");
                    let mut rng = rand::thread_rng();
                    let mut port = BASE_PORT as i32;
                    let mut rc = -1;
                    for i in 0..=MAX_RESOLVE_RETRY {
                        let mut src = sockaddr_v4(src_ip, port as u16);
                        // SAFETY: live id, valid sockaddrs.
                        rc = unsafe {
                            rdma_resolve_addr(
                                cm_id,
                                &mut src as *mut libc::sockaddr_in as *mut sockaddr,
                                &mut dst as *mut libc::sockaddr_in as *mut sockaddr,
                                TIMEOUT_MS,
                            )
                        };
                        if rc == 0 || i == MAX_RESOLVE_RETRY {
                            break;
                        }
                        port = 10_000 + rng.gen_range(0..40_000);
                    }
                    rc
                }
                None => {
                    // SAFETY: live id, valid destination sockaddr.
                    unsafe {
                        rdma_resolve_addr(
                            cm_id,
                            ptr::null_mut(),
                            &mut dst as *mut libc::sockaddr_in as *mut sockaddr,
                            TIMEOUT_MS,
                        )
                    }
                }
            };
            assert_eq!(rc, 0, "failed to resolve the RDMA address");

            if ep.wait_status_change(ConnStatus::Connecting) == ConnStatus::Connected {
                break;
            }

            retries += 1;
            assert!(
                retries <= MAX_RESOLVE_RETRY,
                "node {} unreachable after {} attempts",
                node.id,
                retries
            );
            thread::sleep(Duration::from_millis(500));
        }

        self.shared
            .make_transport(ep, self.shared.send_pool(), local);
        log::debug!("connected to node {}", node.id);
    }

    /// Submit a message towards `msg.meta.recver`.
    /// Return the number of bytes sent (packed meta plus payload).
    pub fn send_msg(&self, msg: &mut Message) -> usize {
        let remote_id = msg.meta.recver;
        assert_ne!(remote_id, Node::EMPTY, "message has no receiver");
        let ep = self
            .shared
            .endpoints
            .get(&remote_id)
            .unwrap_or_else(|| panic!("no endpoint for node {}", remote_id))
            .clone();
        let trans = self.shared.transport_for(&ep);

        msg.meta.sender = self.shared.my_node.lock().unwrap().id;

        trans.register_memory(msg);

        if msg.is_valid_pushpull() {
            trans.add_meta(msg);
            self.pack_worker_tensor_address(msg);
        }

        let inline_len = msg.meta.packed_len();
        let inline_buf = self.shared.send_pool().alloc(inline_len);
        // SAFETY: the pool handed us at least `inline_len` bytes.
        msg.meta.pack(unsafe {
            std::slice::from_raw_parts_mut(inline_buf.as_ptr(), inline_buf.len())
        });

        let total_len = inline_len + msg.data_size();

        let mut msg_buf = MessageBuffer::new(inline_buf, inline_len, msg.data.clone());
        trans.prepare_data(msg, &mut msg_buf);
        let id = self.shared.insert_inflight(msg_buf);

        if !msg.is_valid_pushpull() {
            // Control messages take the rendezvous path every time.
            trans.send_rendezvous_begin(msg, id);
            return total_len;
        }

        let is_push = msg.meta.push;
        let key = msg.meta.key;
        let remote = match self.shared.has_remote_info(id, key, is_push, remote_id) {
            Some(remote) => remote,
            None => {
                trans.send_rendezvous_begin(msg, id);
                return total_len;
            }
        };

        // Destination already known: go straight to the one-sided write.
        match msg.kind() {
            MsgKind::PushRequest => trans.send_push_request(msg, id, remote),
            MsgKind::PushResponse => trans.send_push_response(msg, id, remote),
            MsgKind::PullRequest => trans.send_pull_request(msg, id, remote),
            MsgKind::PullResponse => trans.send_pull_response(msg, id, remote),
            MsgKind::Control => unreachable!(),
        }

        total_len
    }

    /// Block until a message arrives, reconstruct its segments, and
    /// return the number of bytes received.
    pub fn recv_msg(&self, msg: &mut Message) -> usize {
        msg.data.clear();

        let (ep, bc, idx) = self
            .shared
            .delivery_rx
            .recv()
            .expect("delivery queue closed");

        // SAFETY: the slot buffer holds at least one packed meta.
        let buf = unsafe {
            std::slice::from_raw_parts(bc.buffer.as_ptr(), bc.buffer.len())
        };
        msg.meta = Meta::unpack(buf);
        msg.meta.recver = self.shared.my_node.lock().unwrap().id;
        msg.meta.sender = ep.node_id();

        let meta_len = msg.meta.packed_len();
        let mut total_len = meta_len;

        if !msg.is_valid_pushpull() {
            // Control slots are one-shot; data slots persist for reuse.
            self.shared.addr_pool.release(idx);
            return total_len;
        }

        let trans = self.shared.transport_for(&ep);
        match msg.kind() {
            MsgKind::PushRequest => {
                total_len += trans.recv_push_request(msg, &bc);
                self.store_worker_tensor_address(msg);
            }
            MsgKind::PushResponse => total_len += trans.recv_push_response(msg, &bc),
            MsgKind::PullRequest => total_len += trans.recv_pull_request(msg, &bc),
            MsgKind::PullResponse => total_len += trans.recv_pull_response(msg, &bc),
            MsgKind::Control => unreachable!(),
        }

        total_len
    }

    /// On pull responses, target the worker's own value buffer with the
    /// triple learned from its first push request.
    fn pack_worker_tensor_address(&self, msg: &mut Message) {
        if msg.kind() != MsgKind::PullResponse {
            return;
        }
        let info_map = self.shared.tensor_info.lock().unwrap();
        let info = info_map
            .get(&(msg.meta.key, msg.meta.recver))
            .unwrap_or_else(|| {
                panic!(
                    "no tensor address for key={} recver={}",
                    msg.meta.key, msg.meta.recver
                )
            });
        msg.meta.val_len = info.val_len;
        msg.meta.addr = info.addr;
        msg.meta.option = info.rkey;
    }

    /// Remember where a worker keeps the values of `key`. Re-observed
    /// addresses must match: workers never move a tensor.
    fn store_worker_tensor_address(&self, msg: &Message) {
        let info = TensorInfo {
            val_len: msg.meta.val_len,
            addr: msg.meta.addr,
            rkey: msg.meta.option,
        };
        let mut info_map = self.shared.tensor_info.lock().unwrap();
        match info_map.entry((msg.meta.key, msg.meta.sender)) {
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(info);
            }
            std::collections::hash_map::Entry::Occupied(e) => {
                assert!(
                    *e.get() == info,
                    "worker moved tensor key={} in place",
                    msg.meta.key
                );
            }
        }
    }
}

impl Default for Van {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Van {
    fn drop(&mut self) {
        if !self.shared.should_stop.load(Ordering::SeqCst) {
            self.stop();
        }
    }
}

fn sockaddr_v4(ip: Ipv4Addr, port: u16) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(ip.octets()),
        },
        sin_zero: [0; 8],
    }
}

fn resolve_v4(host: &str, port: u16) -> Result<SocketAddr, Error> {
    (host, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.find(|addr| addr.is_ipv4()))
        .ok_or_else(|| Error::AddrResolve(format!("{}:{}", host, port)))
}

/// Immediate data of a work completion.
#[inline]
fn wc_imm(wc: &ibv_wc) -> Imm {
    // SAFETY: the completion carried IBV_WC_WITH_IMM.
    unsafe { wc.imm_data_invalidated_rkey_union.imm_data }
}

/// Dispatch one successful work completion.
fn handle_wc(shared: &Arc<Shared>, wc: &ibv_wc) {
    assert!(
        wc.status == ibv_wc_status::IBV_WC_SUCCESS,
        "work completion failed: status={} wr_id={} vendor_err={}",
        wc.status,
        wc.wr_id,
        wc.vendor_err
    );

    let ctx = shared.ctx_table.get(wc.wr_id as CtxHandle);
    let ep = ctx.ep.clone();

    match wc.opcode {
        ibv_wc_opcode::IBV_WC_SEND => release_ctx(&ctx),
        ibv_wc_opcode::IBV_WC_RDMA_WRITE => {
            // The signaled meta write retired: the message is out.
            let id = ctx.cookie.swap(0, Ordering::AcqRel);
            shared.remove_inflight(id);
            release_ctx(&ctx);
        }
        ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM => {
            let idx = wc_imm(wc);
            let bc = shared.addr_pool.get(idx);
            shared
                .delivery_tx
                .send((ep, bc, idx))
                .expect("delivery queue closed");
            release_ctx(&ctx);
        }
        ibv_wc_opcode::IBV_WC_RECV => {
            assert!(
                wc.wc_flags & ibv_wc_flags::IBV_WC_WITH_IMM.0 != 0,
                "plain receive on a rendezvous endpoint"
            );
            let trans = shared.transport_for(&ep);
            match wc_imm(wc) {
                IMM_RENDEZVOUS_START => {
                    // SAFETY: the peer sent a whole frame into this chunk.
                    let req = unsafe { RendezvousStart::read_from(ctx.chunk_ptr()) };
                    trans.send_rendezvous_reply(req);
                }
                IMM_RENDEZVOUS_REPLY => {
                    // SAFETY: same as above.
                    let resp = unsafe { RendezvousReply::read_from(ctx.chunk_ptr()) };
                    let remote = (resp.addr, resp.rkey, resp.idx);
                    // Cache first: later sends for this key skip the
                    // handshake entirely.
                    shared.store_remote_info(resp.origin_addr, remote);
                    trans.write_with_imm(resp.origin_addr, remote);
                }
                imm => panic!("unknown rendezvous immediate {}", imm),
            }
            release_ctx(&ctx);
        }
        opcode => panic!("unexpected work-completion opcode {}", opcode),
    }
}

fn release_ctx(ctx: &Arc<WrContext>) {
    match ctx.kind {
        CtxKind::RendezvousStart => ctx.ep.free_start.push(ctx.id),
        CtxKind::RendezvousReply => ctx.ep.free_reply.push(ctx.id),
        CtxKind::Write => ctx.ep.free_write.push(ctx.id),
        CtxKind::Receive => ctx.ep.post_recv(ctx),
    }
}

/// Busy-poll loop of the CQ thread.
fn cq_loop(shared: Arc<Shared>) {
    let cq = shared.cq_ptr();
    assert!(!cq.is_null());

    let mut wcs: Vec<ibv_wc> = (0..MAX_CONCURRENT_WR)
        // SAFETY: POD completion entries, overwritten by the poll.
        .map(|_| unsafe { mem::zeroed() })
        .collect();

    while !shared.should_stop.load(Ordering::Relaxed) {
        // SAFETY: live CQ and a correctly-sized completion array.
        let n = unsafe { ibv_poll_cq(cq, wcs.len() as i32, wcs.as_mut_ptr()) };
        assert!(n >= 0, "ibv_poll_cq failed");
        for wc in &wcs[..n as usize] {
            handle_wc(&shared, wc);
        }
    }
}

/// Non-blocking poll loop of the CM-event thread.
fn cm_event_loop(shared: Arc<Shared>, channel: *mut rdma_event_channel) {
    // SAFETY: live event channel.
    let fd = unsafe { (*channel).fd };
    // SAFETY: FFI on our own fd.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        assert!(flags >= 0);
        assert!(libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) >= 0);
    }

    const ERROR_FLAGS: libc::c_short = libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;

    while !shared.should_stop.load(Ordering::Relaxed) {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: valid pollfd array of one.
        let ret = unsafe { libc::poll(&mut pfd, 1, 10) };
        assert!(ret >= 0, "poll on the CM channel failed");
        assert_eq!(pfd.revents & ERROR_FLAGS, 0, "CM channel error");
        if pfd.revents & libc::POLLIN == 0 {
            continue;
        }

        let mut event = ptr::null_mut();
        // SAFETY: the channel reported readable.
        let rc = unsafe { rdma_get_cm_event(channel, &mut event) };
        assert_eq!(rc, 0, "failed to fetch a CM event");

        // SAFETY: a fetched event is valid until acked.
        let ev = unsafe { (*event).event };
        match ev {
            rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST => {
                on_connect_request(&shared, event)
            }
            rdma_cm_event_type::RDMA_CM_EVENT_ADDR_RESOLVED => {
                // SAFETY: event id is live.
                let rc = unsafe { rdma_resolve_route((*event).id, TIMEOUT_MS) };
                assert_eq!(rc, 0, "failed to resolve the RDMA route");
            }
            rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_RESOLVED => {
                on_route_resolved(&shared, event)
            }
            rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED => on_connected(&shared, event),
            rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED => {
                let ep = endpoint_of(&shared, event);
                ep.set_status(ConnStatus::Idle);
                log::info!("disconnected from node {}", ep.node_id());
            }
            rdma_cm_event_type::RDMA_CM_EVENT_REJECTED
            | rdma_cm_event_type::RDMA_CM_EVENT_ADDR_ERROR => {
                let ep = endpoint_of(&shared, event);
                log::debug!("connection to node {} rejected, retrying", ep.node_id());
                ep.set_status(ConnStatus::Rejected);
            }
            other => {
                // SAFETY: FFI string lookup.
                let name = unsafe { std::ffi::CStr::from_ptr(rdma_event_str(other)) };
                panic!("unhandled CM event {:?}", name);
            }
        }

        // SAFETY: fetched above and fully handled.
        let rc = unsafe { rdma_ack_cm_event(event) };
        assert_eq!(rc, 0, "failed to ack a CM event");
    }
}

fn endpoint_of(shared: &Arc<Shared>, event: *mut rdma_cm_event) -> Arc<Endpoint> {
    // SAFETY: a fetched event is valid until acked.
    let id = unsafe { (*event).id };
    shared
        .cm_ids
        .get(&(id as usize))
        .expect("CM event for unknown endpoint")
        .clone()
}

fn conn_param(ctx: &RequestContext) -> rdma_conn_param {
    // SAFETY: POD parameter block for FFI.
    let mut param: rdma_conn_param = unsafe { mem::zeroed() };
    param.retry_count = 7;
    param.rnr_retry_count = 7;
    param.private_data = ctx as *const RequestContext as *const libc::c_void;
    param.private_data_len = mem::size_of::<RequestContext>() as u8;
    param
}

fn my_request_context(shared: &Arc<Shared>) -> RequestContext {
    let my_node = shared.my_node.lock().unwrap();
    RequestContext::new(my_node.id as u32, my_node.port as u16, &my_node.hostname)
}

/// A peer wants in: build the passive-side endpoint and accept.
fn on_connect_request(shared: &Arc<Shared>, event: *mut rdma_cm_event) {
    // SAFETY: a fetched event is valid until acked.
    let (id, private_data, private_len) = unsafe {
        (
            (*event).id,
            (*event).param.conn.private_data,
            (*event).param.conn.private_data_len,
        )
    };
    assert!(!id.is_null());
    assert!(!private_data.is_null(), "connect request without private data");
    assert!(
        (private_len as usize) >= mem::size_of::<RequestContext>(),
        "CM private data too short: {} bytes",
        private_len
    );
    // SAFETY: length checked above.
    let remote_ctx = unsafe { RequestContext::read_from(private_data as *const u8) };

    log::debug!(
        "connect request from node {} ({}:{})",
        remote_ctx.node,
        remote_ctx.hostname_str(),
        remote_ctx.port
    );

    let ep = Endpoint::new();
    ep.set_node_id(remote_ctx.node as NodeId);
    ep.set_cm_id(id);
    shared.cm_ids.insert(id as usize, ep.clone());
    shared.incoming.lock().unwrap().push(ep.clone());

    // SAFETY: the id of a connect request carries the device context.
    shared.init_context(unsafe { (*id).verbs });
    ep.init(
        shared.cq_ptr(),
        shared.pd(),
        &shared.recv_pool(),
        &shared.ctx_table,
    );

    let local = shared
        .is_local
        .get(&(remote_ctx.node as NodeId))
        .map(|v| *v)
        .unwrap_or(false);
    shared.make_transport(ep, shared.recv_pool(), local);

    let my_ctx = my_request_context(shared);
    let mut param = conn_param(&my_ctx);
    // SAFETY: live id; `my_ctx` outlives the call.
    let rc = unsafe { rdma_accept(id, &mut param) };
    assert_eq!(rc, 0, "failed to accept a CM connection");
}

/// Route is known: build the active-side QP and connect.
fn on_route_resolved(shared: &Arc<Shared>, event: *mut rdma_cm_event) {
    // SAFETY: a fetched event is valid until acked.
    let id = unsafe { (*event).id };
    let ep = endpoint_of(shared, event);

    // SAFETY: a route-resolved id carries the device context.
    shared.init_context(unsafe { (*id).verbs });
    ep.init(
        shared.cq_ptr(),
        shared.pd(),
        &shared.send_pool(),
        &shared.ctx_table,
    );

    let my_ctx = my_request_context(shared);
    let mut param = conn_param(&my_ctx);
    // SAFETY: live id; `my_ctx` outlives the call.
    let rc = unsafe { rdma_connect(id, &mut param) };
    assert_eq!(rc, 0, "failed to issue the CM connect");
}

/// Connection established on either side.
fn on_connected(shared: &Arc<Shared>, event: *mut rdma_cm_event) {
    let ep = endpoint_of(shared, event);

    let mut cq_thread = shared.cq_thread.lock().unwrap();
    if cq_thread.is_none() {
        let shared2 = shared.clone();
        *cq_thread = Some(
            thread::Builder::new()
                .name("cq-poller".into())
                .spawn(move || cq_loop(shared2))
                .expect("failed to spawn the CQ poller"),
        );
    }
    drop(cq_thread);

    ep.set_status(ConnStatus::Connected);
    log::debug!("connected with node {}", ep.node_id());
}
