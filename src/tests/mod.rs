//! Cross-module tests that exercise the protocol state without a NIC.

#![allow(unused_imports)]

mod backpressure;
mod cache;
mod reconstruct;
mod status;
