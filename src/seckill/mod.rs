//! Flash-Sale (Seckill) Ordering
//!
//! - [`SeckillPipeline`] - atomic admission, order queue, single consumer
//! - [`OrderStatusBoard`] - where each accepted order ended up
//! - [`PipelineMetrics`] - admission and persistence counters

pub mod metrics;
pub mod pipeline;
pub mod status;
pub mod task;

pub use metrics::{PipelineMetrics, PipelineMetricsSnapshot};
pub use pipeline::{PipelineConfig, SeckillPipeline};
pub use status::{OrderStatus, OrderStatusBoard};
pub use task::{AdmissionResult, PersistOutcome, RejectReason, SeckillTask};
