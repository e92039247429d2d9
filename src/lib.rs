//! Purpose: Shared library crate for the relaystore scaleout message buffer.
//! Exports: `api` (stable public surface), `notice` (structured trace notices).
//! Role: Public API boundary with private internal storage modules.
//! Invariants: Additive-only changes to `api`; internal modules remain private.
//! Invariants: Core append/read paths are lock-free and never fail.
pub mod api;
mod core;
pub mod notice;
