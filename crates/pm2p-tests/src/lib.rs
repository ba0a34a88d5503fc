//! End-to-end helpers: real nodes on loopback TCP with temporary state.

pub mod harness;
