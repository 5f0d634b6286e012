//! Atomic counter stores.
//!
//! The limiter never reads-then-writes a counter. Every store exposes a
//! single atomic "increment, and set the expiry if this created the key"
//! primitive, and concurrent increments on one key are linearized by the
//! store itself.

mod backend;
mod memory;
mod redis;

pub use backend::{CounterStore, StoreError};
pub use memory::InMemoryCounterStore;
pub use self::redis::RedisCounterStore;
