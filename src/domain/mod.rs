//! Domain Layer
//!
//! Ports (traits over external systems), value objects and domain events.
//!
//! # Usage
//!
//! ```ignore
//! use flashsale::domain::ports::KeyValueStore;
//!
//! async fn warm<S: KeyValueStore + ?Sized>(store: &S) -> Result<()> {
//!     store.set("cache:shop:1", "{}", None).await
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::DomainEvent;
pub use ports::{
    // Port traits
    EventPublisher,
    KeyValueStore,
    OrderRepository,
    OrderTx,
    ShopRepository,
    // Value objects
    AdmissionCode,
    SeckillVoucher,
    Shop,
    ShopType,
    VoucherOrder,
};
