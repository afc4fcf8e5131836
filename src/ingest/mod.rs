//! Ingestion drivers: move samples from a source into [`AggregationState`].
//!
//! Two shapes exist. [`EventDriver`] consumes the bounded queue a tracer
//! feeds; [`PollDriver`] reads pre-opened sysfs counters itself. Both apply
//! the [`EntityFilter`] before anything reaches the shared state.
//!
//! [`AggregationState`]: crate::state::AggregationState

pub mod batch;
pub mod event;
pub mod filter;
pub mod poll;

pub use batch::{SampleBatch, DEFAULT_FLUSH_EVERY};
pub use event::{DriverState, EventDriver};
pub use filter::EntityFilter;
pub use poll::{parse_inflight, InflightReader, PollDriver, PollGroup, PolledSource};
