//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  KeyValueStore │ OrderRepository │ ShopRepository         │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ RedisStore │ InMemoryStore │ InMemoryOrderRepository      │ │
//! │  │ InMemoryShopRepository │ LoggingEventPublisher            │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use flashsale::adapters::RedisStore;
//! use flashsale::domain::ports::KeyValueStore;
//!
//! let store = RedisStore::connect("redis://127.0.0.1:6379/0").await?;
//! store.set("cache:shop:1", "{}", None).await?;
//! ```

mod memory_repository;
mod memory_store;
mod redis_store;

pub use memory_repository::{InMemoryOrderRepository, InMemoryShopRepository};
pub use memory_store::InMemoryStore;
pub use redis_store::RedisStore;

// Re-export event publishers for convenience
mod event_publisher;
pub use event_publisher::{InMemoryEventCollector, LoggingEventPublisher};
