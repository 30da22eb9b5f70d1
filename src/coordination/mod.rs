//! Store-Backed Coordination
//!
//! Primitives shared by the cache client and the order pipeline:
//!
//! - [`DistributedLock`] - conditional-set mutex with holder tokens
//! - [`IdGenerator`] - time-ordered 64-bit IDs from a daily store counter

pub mod id_generator;
pub mod lock;

pub use id_generator::{compose_id, decompose_id, IdGenerator, BEGIN_TIMESTAMP, COUNT_BITS};
pub use lock::{DistributedLock, LockHandle};
