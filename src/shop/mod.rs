//! Shop Reads and Updates over the Cache

pub mod service;

pub use service::{CacheStrategy, ShopService};
