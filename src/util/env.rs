//! Environment-variable configuration.
//!
//! The surrounding framework configures the transport entirely through
//! `DMLC_*` / `BYTEPS_*` environment variables; this module gathers the
//! typed accessors in one place so defaults are not scattered around.

use std::env;
use std::str::FromStr;

use crate::message::Role;

/// Read an environment variable, treating empty values as unset.
pub fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

/// Read an environment variable and parse it, falling back to `default`
/// when unset or unparsable.
pub fn var_or<T: FromStr>(name: &str, default: T) -> T {
    match var(name).and_then(|v| v.parse().ok()) {
        Some(v) => v,
        None => default,
    }
}

/// Read a 0/1-style boolean variable.
pub fn flag(name: &str, default: bool) -> bool {
    var_or(name, default as i64) != 0
}

/// Role of this process, from `DMLC_ROLE`.
pub fn role() -> Role {
    match var("DMLC_ROLE").as_deref() {
        Some("scheduler") => Role::Scheduler,
        Some("server") => Role::Server,
        Some("worker") | None => Role::Worker,
        Some(other) => panic!("unknown DMLC_ROLE: {}", other),
    }
}

/// Whether verbose transport logging is requested (`ENABLE_RDMA_LOG`).
pub fn rdma_log_enabled() -> bool {
    flag("ENABLE_RDMA_LOG", false)
}

/// Whether the shared-memory fast path may be used (`BYTEPS_ENABLE_IPC`).
pub fn ipc_enabled() -> bool {
    flag("BYTEPS_ENABLE_IPC", false)
}

/// Number of IPC copy worker threads (`BYTEPS_IPC_COPY_NUM_THREADS`).
pub fn ipc_copy_threads() -> usize {
    var_or("BYTEPS_IPC_COPY_NUM_THREADS", 4)
}

/// Whether pull-response copies run on the worker pool
/// (`BYTEPS_IPC_ENABLE_ASYNC_COPY`).
pub fn ipc_async_copy() -> bool {
    flag("BYTEPS_IPC_ENABLE_ASYNC_COPY", true)
}

/// Raw shared-memory partition size in bytes (`BYTEPS_PARTITION_BYTES`).
pub fn partition_bytes() -> usize {
    var_or("BYTEPS_PARTITION_BYTES", 4_096_000)
}

/// Number of local workers sharing a host (`BYTEPS_LOCAL_SIZE`).
pub fn local_size() -> usize {
    var_or("BYTEPS_LOCAL_SIZE", 8)
}

/// Bind-address override (`DMLC_NODE_HOST`).
pub fn node_host() -> Option<String> {
    var("DMLC_NODE_HOST")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        // These variables are never set in the test environment.
        assert_eq!(var_or("TENSORVAN_TEST_UNSET", 42i32), 42);
        assert!(!flag("TENSORVAN_TEST_UNSET", false));
        assert!(flag("TENSORVAN_TEST_UNSET", true));
        assert_eq!(partition_bytes(), 4_096_000);
        assert_eq!(ipc_copy_threads(), 4);
    }
}
