//! Purpose: Define the stable public Rust API boundary for relaystore.
//! Exports: Core types and operations needed by backplane transports.
//! Role: Public, additive-only surface; hides internal storage modules.
//! Invariants: This module is the only public path to storage primitives.
//! Invariants: Internal modules remain private and are not directly exposed.

mod message;

pub use crate::core::cursor::MessageBatch;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::fragment::Mapping;
pub use crate::core::ring::{Ring, RingOptions, MIN_CAPACITY};
pub use message::{Message, Meta, StoreApiExt, Tail, TailOptions};
