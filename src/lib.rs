//! Flashsale - Cache-Aside Reads and Flash-Sale Ordering
//!
//! Defends a slow backing store against cache penetration and cache
//! breakdown, and admits flash-sale purchases at most once per user per
//! voucher under heavy concurrent demand.
//!
//! # Architecture
//!
//! ```text
//! submit ─► SeckillPipeline ─► admission script ─► queue ─► consumer ─► OrderRepository
//!                 │                (KeyValueStore)             │
//!                 └─ IdGenerator                    DistributedLock (per user)
//!
//! read ───► CacheClient ─► KeyValueStore
//!                 └─ loader ─► ShopRepository    (rebuilds under DistributedLock)
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Redis and in-memory implementations of the domain ports
//! - [`cache`] - Cache-aside client with null caching and logical expiry
//! - [`coordination`] - Distributed lock and ID generator
//! - [`domain`] - Ports (traits), value objects and events
//! - [`error`] - Error types
//! - [`keys`] - Key layout shared with other services
//! - [`seckill`] - Admission and order persistence pipeline
//! - [`shop`] - Cached shop lookups
//! - [`telemetry`] - Prometheus exposition

pub mod adapters;
pub mod cache;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod keys;
pub mod seckill;
pub mod shop;
pub mod telemetry;

// Re-export commonly used types
pub use cache::{CacheClient, CacheConfig, KeySpace};
pub use coordination::{DistributedLock, IdGenerator, LockHandle};
pub use error::{Error, Result};
pub use seckill::{AdmissionResult, PipelineConfig, RejectReason, SeckillPipeline};
pub use shop::{CacheStrategy, ShopService};
