//! Shared-memory carrier for same-host peers.
//!
//! Values never touch the wire here: workers stage them in a shared
//! segment out-of-band, so a push request sends meta only, and a pull
//! response copies values into the segment (optionally on a small
//! worker pool) before the meta write.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use ahash::RandomState;
use crossbeam::channel::{unbounded, Receiver, Sender};
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, MapFlags, ProtFlags};
use nix::sys::stat::{fstat, Mode};

use crate::error::Error;
use crate::message::Message;
use crate::msgbuf::MessageBuffer;
use crate::transport::{reconstruct, RdmaTransport};
use crate::type_alias::*;
use crate::util::env;
use crate::util::math::{align_ceil, page_size};
use crate::van::{BufferContext, RemoteTuple};

/// Name prefix of the segments the local workers populate.
const SHM_PREFIX: &str = "BytePS_ShM_";

/// A mapped view of an externally-owned shared segment.
struct ShmSegment {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for ShmSegment {}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // The co-process owns the segment; we only unmap our view.
        // SAFETY: mapped by us with this exact length.
        unsafe {
            let _ = munmap(self.ptr.cast(), self.len);
        }
    }
}

struct CopyJob {
    id: MsgBufId,
    remote: RemoteTuple,
    dst: *mut u8,
    src: *const u8,
    len: usize,
}

unsafe impl Send for CopyJob {}

/// The IPC carrier. Wraps the verbs carrier of the same endpoint and
/// overrides the three paths where values move through shared memory.
pub(crate) struct IpcTransport {
    rdma: RdmaTransport,

    copy_tx: Vec<Sender<CopyJob>>,
    copy_threads: Vec<thread::JoinHandle<()>>,
    copy_counter: AtomicU64,
    async_copy: bool,

    partition_bytes: usize,
    /// base key -> mapped segment
    segments: Mutex<HashMap<Key, ShmSegment, RandomState>>,
}

impl IpcTransport {
    pub fn new(rdma: RdmaTransport) -> Self {
        let nthreads = env::ipc_copy_threads();
        let async_copy = env::ipc_async_copy();
        if !async_copy {
            log::info!("async IPC copy disabled, this could affect performance");
        }

        let partition_bytes = align_ceil(
            env::partition_bytes(),
            env::local_size() * page_size(),
        );

        let mut copy_tx = Vec::with_capacity(nthreads);
        let mut copy_threads = Vec::with_capacity(nthreads);
        for i in 0..nthreads {
            let (tx, rx): (Sender<CopyJob>, Receiver<CopyJob>) = unbounded();
            let worker_rdma = rdma.clone();
            copy_tx.push(tx);
            copy_threads.push(
                thread::Builder::new()
                    .name(format!("ipc-copy-{}", i))
                    .spawn(move || copy_loop(worker_rdma, rx))
                    .expect("failed to spawn IPC copy thread"),
            );
        }

        Self {
            rdma,
            copy_tx,
            copy_threads,
            copy_counter: AtomicU64::new(0),
            async_copy,
            partition_bytes,
            segments: Mutex::new(HashMap::with_hasher(RandomState::new())),
        }
    }

    /// Locate `key`'s partition inside its shared segment, mapping the
    /// segment on first use.
    fn shared_memory(&self, key: Key) -> *mut u8 {
        let seq = key % (1 << 16);
        let base = key - seq;
        let offset = self.partition_bytes * seq as usize;

        let mut segments = self.segments.lock().unwrap();
        if let Some(seg) = segments.get(&base) {
            assert!(offset + self.partition_bytes <= seg.len);
            return (seg.ptr.as_ptr() as usize + offset) as *mut u8;
        }

        let seg = map_segment(base).unwrap_or_else(|e| panic!("{}", e));
        log::debug!(
            "opened shared memory for base key {}: offset={} size={}",
            base,
            offset,
            seg.len
        );
        let at = (seg.ptr.as_ptr() as usize + offset) as *mut u8;
        assert!(offset + self.partition_bytes <= seg.len);
        segments.insert(base, seg);
        at
    }

    pub fn register_memory(&self, msg: &Message) {
        self.rdma.register_memory(msg)
    }

    pub fn add_meta(&self, msg: &mut Message) {
        self.rdma.add_meta(msg)
    }

    /// Push requests carry no wire payload on this carrier: leaving the
    /// MR list empty makes the base write path send meta only.
    pub fn prepare_data(&self, _msg: &Message, _msg_buf: &mut MessageBuffer) {}

    pub fn send_rendezvous_begin(&self, msg: &Message, id: MsgBufId) {
        self.rdma.send_rendezvous_begin(msg, id)
    }

    pub fn send_rendezvous_reply(&self, req: crate::wire::RendezvousStart) {
        self.rdma.send_rendezvous_reply(req)
    }

    pub fn write_with_imm(&self, id: MsgBufId, remote: RemoteTuple) {
        self.rdma.write_with_imm(id, remote)
    }

    pub fn send_push_request(&self, msg: &Message, id: MsgBufId, remote: RemoteTuple) {
        // The values already sit in the shared segment.
        self.rdma.send_push_request(msg, id, remote)
    }

    pub fn send_push_response(&self, msg: &Message, id: MsgBufId, remote: RemoteTuple) {
        self.rdma.send_push_response(msg, id, remote)
    }

    pub fn send_pull_request(&self, msg: &Message, id: MsgBufId, remote: RemoteTuple) {
        self.rdma.send_pull_request(msg, id, remote)
    }

    /// Copy the values into the worker's partition, then write the meta.
    pub fn send_pull_response(&self, msg: &Message, id: MsgBufId, remote: RemoteTuple) {
        let vals = &msg.data[1];
        assert!(!vals.is_empty(), "pull response without values");
        let dst = self.shared_memory(msg.meta.key);
        let len = msg.meta.val_len as usize;

        if self.async_copy {
            let job = CopyJob {
                id,
                remote,
                dst,
                src: vals.as_ptr(),
                len,
            };
            // Round-robin across the copy workers.
            let n = self.copy_counter.fetch_add(1, Ordering::Relaxed);
            self.copy_tx[n as usize % self.copy_tx.len()]
                .send(job)
                .expect("IPC copy worker gone");
        } else {
            // SAFETY: both regions are live and `len` bytes long.
            unsafe { std::ptr::copy_nonoverlapping(vals.as_ptr(), dst, len) };
            self.rdma.write_with_imm(id, remote);
        }
    }

    /// Values come from the shared segment, not the receive buffer.
    pub fn recv_push_request(&self, msg: &mut Message, bc: &Arc<BufferContext>) -> usize {
        assert!(msg.meta.push && msg.meta.request);
        assert_eq!(bc.data_num, 3, "push request must carry three segments");

        let addr = self.shared_memory(msg.meta.key);
        let len = msg.meta.val_len as usize;

        let keys = super::functional_segment(&crate::message::encode_key(msg.meta.key));
        // SAFETY: the mapped segment lives as long as this transport.
        let vals = unsafe { crate::message::Segment::borrowed(addr, len) };
        let lens = super::functional_segment(&msg.meta.val_len.to_le_bytes());

        let total = keys.len() + vals.len() + lens.len();
        msg.data.push(keys);
        msg.data.push(vals);
        msg.data.push(lens);
        total
    }

    pub fn recv_push_response(&self, msg: &mut Message, bc: &Arc<BufferContext>) -> usize {
        self.rdma.recv_push_response(msg, bc)
    }

    pub fn recv_pull_request(&self, msg: &mut Message, bc: &Arc<BufferContext>) -> usize {
        self.rdma.recv_pull_request(msg, bc)
    }

    pub fn recv_pull_response(&self, msg: &mut Message, bc: &Arc<BufferContext>) -> usize {
        reconstruct::pull_response(msg, bc)
    }
}

impl Drop for IpcTransport {
    fn drop(&mut self) {
        // Workers exit once every sender is gone.
        self.copy_tx.clear();
        for handle in self.copy_threads.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Map the externally-created segment `<prefix><base>` read-write.
fn map_segment(base: Key) -> Result<ShmSegment, Error> {
    let name = format!("/{}{}", SHM_PREFIX, base);
    let shm_err = |e: nix::errno::Errno| Error::Shm(name.clone(), e.into());

    let fd = shm_open(name.as_str(), OFlag::O_RDWR, Mode::from_bits_truncate(0o666))
        .map_err(shm_err)?;
    let len = fstat(fd.as_fd()).map_err(shm_err)?.st_size as usize;

    // SAFETY: mapping a shared segment owned by the co-process.
    let ptr = unsafe {
        mmap(
            None,
            NonZeroUsize::new(len).expect("empty shared segment"),
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            &fd,
            0,
        )
    }
    .map_err(shm_err)?;

    Ok(ShmSegment {
        ptr: ptr.cast(),
        len,
    })
}

fn copy_loop(rdma: RdmaTransport, rx: Receiver<CopyJob>) {
    while let Ok(job) = rx.recv() {
        if job.len == 0 {
            continue;
        }
        // SAFETY: the sender guaranteed both regions live and disjoint.
        unsafe { std::ptr::copy_nonoverlapping(job.src, job.dst, job.len) };
        rdma.write_with_imm(job.id, job.remote);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_arithmetic() {
        // Mirrors `shared_memory` without any mapping.
        let partition_bytes = align_ceil(4_096_000, 8 * page_size());
        assert_eq!(partition_bytes % page_size(), 0);
        assert!(partition_bytes >= 4_096_000);

        let key: Key = (7 << 16) + 42;
        let seq = key % (1 << 16);
        let base = key - seq;
        assert_eq!(seq, 42);
        assert_eq!(base, 7 << 16);
        assert_eq!(partition_bytes * seq as usize % page_size(), 0);
    }

    #[test]
    fn shm_name_format() {
        let base: Key = 65536;
        assert_eq!(format!("/{}{}", SHM_PREFIX, base), "/BytePS_ShM_65536");
    }
}
