//! Shared KV store backends.
//!
//! The queue, contact spool, courier spool and lease lock all live in one
//! shared keyspace so that a horizontally scaled worker fleet coordinates
//! through it. `RedisStore` is the production backend; the testkit crate
//! provides an in-memory implementation with identical scoring semantics.

mod redis;

pub use redis::RedisStore;

use crate::lock::LeaseLock;
use crate::queue::{ContactSpool, CourierSpool, TaskQueue};

/// The full store surface the runtime wires in at composition time.
pub trait Store: TaskQueue + ContactSpool + CourierSpool + LeaseLock {}

impl<T: TaskQueue + ContactSpool + CourierSpool + LeaseLock> Store for T {}
