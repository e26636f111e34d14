use std::io;

use thiserror::Error;

/// Errors surfaced by the control plane.
///
/// The data plane does not use this type: once an endpoint is connected,
/// any work-completion failure is a protocol violation and fatal.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to bind a listener within {0} retries")]
    BindExhausted(usize),

    #[error("cannot resolve address {0}")]
    AddrResolve(String),

    #[error("connection rejected by node {0}")]
    Rejected(i32),

    #[error("RDMA CM call {call} failed: {source}")]
    Cm {
        call: &'static str,
        source: io::Error,
    },

    #[error("shared memory segment {0} unavailable: {1}")]
    Shm(String, io::Error),

    #[cfg(feature = "fabric")]
    #[error("libfabric call {call} failed with {code}")]
    Fabric { call: &'static str, code: i32 },
}

impl Error {
    /// Wrap the current `errno` of a failed CM call.
    pub(crate) fn cm(call: &'static str) -> Self {
        Error::Cm {
            call,
            source: io::Error::last_os_error(),
        }
    }
}
