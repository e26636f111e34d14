//! Type aliases used in this library.

/// [`u64`]: Tensor key, decoded from the first payload segment of a request.
pub type Key = u64;

/// [`i32`]: Node identifier assigned by the framework's scheduler.
pub type NodeId = i32;

/// [`u32`]: Local access key of a registered memory region.
pub type LKey = u32;

/// [`u32`]: Remote access key of a registered memory region.
pub type RKey = u32;

/// [`u32`]: Immediate data carried by a send or an RDMA write.
/// Either a protocol opcode or a receive-slot index.
pub type Imm = u32;

/// [`u64`]: Cookie identifying an in-flight message buffer.
/// Carried in the `origin_addr` field of the rendezvous frames so that no
/// raw pointer ever crosses the wire.
pub(crate) type MsgBufId = u64;

/// [`u32`]: Handle into the send-context table, carried in `wr_id`.
pub(crate) type CtxHandle = u32;
