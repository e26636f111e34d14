//! Boundary types shared with the parameter-server framework.

use std::any::Any;
use std::ptr::NonNull;
use std::sync::Arc;
use std::{fmt, slice};

use serde::{Deserialize, Serialize};

use crate::type_alias::*;

/// Role of a node in the parameter-server topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Scheduler,
    Worker,
    Server,
}

/// Identity of a node, as assigned and broadcast by the scheduler.
///
/// `endpoint_name` is only populated by the fabric variant, where it
/// carries the libfabric address-vector entry exchanged over the
/// bootstrap channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub role: Role,
    pub hostname: String,
    pub port: i32,
    pub aux_id: NodeId,
    pub endpoint_name: Vec<u8>,
}

impl Node {
    /// Unassigned node id.
    pub const EMPTY: NodeId = -1;

    pub fn new(id: NodeId, role: Role, hostname: impl Into<String>, port: i32) -> Self {
        Self {
            id,
            role,
            hostname: hostname.into(),
            port,
            aux_id: Self::EMPTY,
            endpoint_name: Vec::new(),
        }
    }
}

/// Classification of a message by its `(push, request)` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    Control,
    PushRequest,
    PushResponse,
    PullRequest,
    PullResponse,
}

/// Message metadata.
///
/// The fields the transport reads and writes are explicit; everything
/// the framework packs beyond them travels in the opaque `body` blob.
#[derive(Debug, Clone, PartialEq)]
pub struct Meta {
    /// Set on control (non-push/pull) messages.
    pub control: bool,
    pub push: bool,
    pub request: bool,

    pub sender: NodeId,
    pub recver: NodeId,

    /// Tensor key, decoded from the first payload segment of requests.
    pub key: Key,
    /// On push requests: address of the worker's value buffer.
    /// On pull responses: destination address on the worker.
    pub addr: u64,
    /// Value length in bytes.
    pub val_len: i32,
    /// On push requests and pull responses: rkey of `addr`.
    pub option: u32,

    /// Framework-owned opaque meta payload.
    pub body: Vec<u8>,
}

/// Fixed little-endian header preceding the meta body on the wire.
const META_HEADER_LEN: usize = 48;

impl Meta {
    /// Packed length of this meta.
    #[inline]
    pub fn packed_len(&self) -> usize {
        META_HEADER_LEN + self.body.len()
    }

    /// Pack into `buf`, returning the packed length.
    ///
    /// # Panics
    ///
    /// Panic if `buf` is shorter than [`Meta::packed_len`].
    pub fn pack(&self, buf: &mut [u8]) -> usize {
        let len = self.packed_len();
        assert!(buf.len() >= len, "meta buffer too small");

        let mut flags = 0u8;
        flags |= self.push as u8;
        flags |= (self.request as u8) << 1;
        flags |= (self.control as u8) << 2;

        buf[0] = flags;
        buf[1..4].fill(0);
        buf[4..8].copy_from_slice(&self.option.to_le_bytes());
        buf[8..12].copy_from_slice(&self.sender.to_le_bytes());
        buf[12..16].copy_from_slice(&self.recver.to_le_bytes());
        buf[16..24].copy_from_slice(&self.key.to_le_bytes());
        buf[24..32].copy_from_slice(&self.addr.to_le_bytes());
        buf[32..36].copy_from_slice(&self.val_len.to_le_bytes());
        buf[36..40].fill(0);
        buf[40..48].copy_from_slice(&(self.body.len() as u64).to_le_bytes());
        buf[48..len].copy_from_slice(&self.body);
        len
    }

    /// Unpack a meta packed by [`Meta::pack`].
    ///
    /// # Panics
    ///
    /// Panic if `buf` is truncated; the wire guarantees whole frames.
    pub fn unpack(buf: &[u8]) -> Self {
        assert!(buf.len() >= META_HEADER_LEN, "truncated meta header");

        let flags = buf[0];
        let body_len = u64::from_le_bytes(buf[40..48].try_into().unwrap()) as usize;
        assert!(buf.len() >= META_HEADER_LEN + body_len, "truncated meta body");

        Self {
            push: flags & 1 != 0,
            request: flags & 2 != 0,
            control: flags & 4 != 0,
            option: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            sender: i32::from_le_bytes(buf[8..12].try_into().unwrap()),
            recver: i32::from_le_bytes(buf[12..16].try_into().unwrap()),
            key: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            addr: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
            val_len: i32::from_le_bytes(buf[32..36].try_into().unwrap()),
            body: buf[META_HEADER_LEN..META_HEADER_LEN + body_len].to_vec(),
        }
    }
}

/// A shared byte buffer with a reference-counted owner.
///
/// The transport moves segments without copying: a segment may own its
/// bytes (`from_vec`), borrow caller memory (`borrowed`), or keep an
/// arbitrary guard alive while pointing into it (`with_owner`).
pub struct Segment {
    data: NonNull<u8>,
    len: usize,
    _owner: Option<Arc<dyn Any + Send + Sync>>,
}

unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// An empty segment.
    pub fn empty() -> Self {
        Self {
            data: NonNull::dangling(),
            len: 0,
            _owner: None,
        }
    }

    /// A segment owning its bytes.
    pub fn from_vec(v: Vec<u8>) -> Self {
        let owner = Arc::new(v);
        let data = owner.as_ptr() as *mut u8;
        Self {
            // SAFETY: `Vec::as_ptr` of a live vector is never null.
            data: unsafe { NonNull::new_unchecked(data) },
            len: owner.len(),
            _owner: Some(owner),
        }
    }

    /// A segment viewing caller-owned memory.
    ///
    /// # Safety
    ///
    /// `[ptr, ptr + len)` must stay valid for the life of the segment
    /// and all its clones.
    pub unsafe fn borrowed(ptr: *mut u8, len: usize) -> Self {
        Self {
            data: NonNull::new(ptr).expect("null segment pointer"),
            len,
            _owner: None,
        }
    }

    /// A segment pointing into memory kept alive by `owner`.
    ///
    /// # Safety
    ///
    /// `[ptr, ptr + len)` must stay valid while `owner` is alive.
    pub unsafe fn with_owner(
        ptr: *mut u8,
        len: usize,
        owner: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            data: NonNull::new(ptr).expect("null segment pointer"),
            len,
            _owner: Some(owner),
        }
    }

    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View the segment as a byte slice.
    ///
    /// # Safety
    ///
    /// Same requirements as [`std::slice::from_raw_parts`]; in
    /// particular, no one may be writing the memory concurrently.
    #[inline]
    pub unsafe fn as_slice(&self) -> &[u8] {
        slice::from_raw_parts(self.data.as_ptr(), self.len)
    }

    /// View the segment as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// Same requirements as [`std::slice::from_raw_parts_mut`].
    #[inline]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        slice::from_raw_parts_mut(self.data.as_ptr(), self.len)
    }
}

impl Clone for Segment {
    fn clone(&self) -> Self {
        Self {
            data: self.data,
            len: self.len,
            _owner: self._owner.clone(),
        }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("ptr", &self.data.as_ptr())
            .field("len", &self.len)
            .finish()
    }
}

/// A message handed to or produced by the van: meta plus up to three
/// payload segments (keys, values, lengths).
#[derive(Debug, Default, Clone)]
pub struct Message {
    pub meta: Meta,
    pub data: Vec<Segment>,
}

impl Default for Meta {
    fn default() -> Self {
        Self {
            control: false,
            push: false,
            request: false,
            sender: Node::EMPTY,
            recver: Node::EMPTY,
            key: 0,
            addr: 0,
            val_len: 0,
            option: 0,
            body: Vec::new(),
        }
    }
}

impl Message {
    /// Total payload bytes across all segments.
    #[inline]
    pub fn data_size(&self) -> usize {
        self.data.iter().map(|s| s.len()).sum()
    }

    /// `true` for the four data kinds, `false` for control messages.
    #[inline]
    pub fn is_valid_pushpull(&self) -> bool {
        !self.meta.control
    }

    /// Classify by the `(push, request)` flags.
    #[inline]
    pub fn kind(&self) -> MsgKind {
        if self.meta.control {
            MsgKind::Control
        } else {
            match (self.meta.push, self.meta.request) {
                (true, true) => MsgKind::PushRequest,
                (true, false) => MsgKind::PushResponse,
                (false, true) => MsgKind::PullRequest,
                (false, false) => MsgKind::PullResponse,
            }
        }
    }
}

/// Encode a key as little-endian base-256.
#[inline]
pub fn encode_key(key: Key) -> [u8; 8] {
    key.to_le_bytes()
}

/// Decode a key from little-endian base-256 bytes.
/// Inverse of [`encode_key`] for any `u64`.
#[inline]
pub fn decode_key(bytes: &[u8]) -> Key {
    let mut key = 0u64;
    for (i, &b) in bytes.iter().take(8).enumerate() {
        key |= (b as u64) << (8 * i);
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_codec_roundtrip() {
        for key in [
            0u64,
            1,
            255,
            256,
            0x0102_0304_0506_0708,
            u64::MAX,
            u64::MAX - 1,
        ] {
            assert_eq!(decode_key(&encode_key(key)), key);
        }
        // Short inputs decode the available bytes.
        assert_eq!(decode_key(&[0x34, 0x12]), 0x1234);
        assert_eq!(decode_key(&[]), 0);
    }

    #[test]
    fn meta_pack_roundtrip() {
        let meta = Meta {
            control: false,
            push: true,
            request: true,
            sender: 9,
            recver: 8,
            key: 42,
            addr: 0x7fff_0000_1000,
            val_len: 1024,
            option: 0xabcd,
            body: b"opaque framework bytes".to_vec(),
        };

        let mut buf = vec![0u8; meta.packed_len()];
        let n = meta.pack(&mut buf);
        assert_eq!(n, META_HEADER_LEN + meta.body.len());
        assert_eq!(Meta::unpack(&buf), meta);
    }

    #[test]
    fn meta_pack_empty_body() {
        let meta = Meta::default();
        let mut buf = vec![0u8; meta.packed_len()];
        assert_eq!(meta.pack(&mut buf), META_HEADER_LEN);
        assert_eq!(Meta::unpack(&buf), meta);
    }

    #[test]
    fn kind_classification() {
        let mut msg = Message::default();
        msg.meta.control = true;
        assert_eq!(msg.kind(), MsgKind::Control);
        assert!(!msg.is_valid_pushpull());

        msg.meta.control = false;
        msg.meta.push = true;
        msg.meta.request = true;
        assert_eq!(msg.kind(), MsgKind::PushRequest);
        msg.meta.request = false;
        assert_eq!(msg.kind(), MsgKind::PushResponse);
        msg.meta.push = false;
        msg.meta.request = true;
        assert_eq!(msg.kind(), MsgKind::PullRequest);
        msg.meta.request = false;
        assert_eq!(msg.kind(), MsgKind::PullResponse);
    }

    #[test]
    fn segment_ownership() {
        let seg = Segment::from_vec(vec![1, 2, 3, 4]);
        let seg2 = seg.clone();
        drop(seg);
        // SAFETY: `seg2` keeps the backing vector alive.
        assert_eq!(unsafe { seg2.as_slice() }, &[1, 2, 3, 4]);

        let mut backing = vec![7u8; 16];
        // SAFETY: `backing` outlives the segment.
        let seg = unsafe { Segment::borrowed(backing.as_mut_ptr(), backing.len()) };
        assert_eq!(seg.len(), 16);
        assert_eq!(unsafe { seg.as_slice() }[0], 7);

        let guard: Arc<dyn std::any::Any + Send + Sync> = Arc::new(vec![9u8; 8]);
        let ptr = Arc::downcast::<Vec<u8>>(guard.clone()).unwrap().as_ptr() as *mut u8;
        // SAFETY: the guard keeps the vector alive.
        let seg = unsafe { Segment::with_owner(ptr, 8, guard) };
        assert_eq!(unsafe { seg.as_slice() }, &[9u8; 8]);
    }
}
