//! An RDMA transport van for parameter-server tensor traffic.
//!
//! Pairs each outgoing message with a pre-registered remote buffer via
//! a two-frame rendezvous, then moves payloads with zero-copy one-sided
//! writes. Same-host peers short-circuit values through shared memory;
//! the `fabric` feature swaps verbs for libfabric on AWS EFA.

mod addrpool;
mod endpoint;
mod error;
#[cfg(feature = "fabric")]
mod fabric;
mod mempool;
mod message;
mod msgbuf;
mod transport;
mod util;
mod van;
mod wire;

pub mod type_alias;

pub use self::error::Error;
pub use self::message::{decode_key, encode_key, Message, Meta, MsgKind, Node, Role, Segment};
pub use self::van::Van;

#[cfg(feature = "fabric")]
pub use self::fabric::FabricVan;

#[cfg(test)]
mod tests;
