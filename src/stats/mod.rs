//! Traffic statistics

pub mod metrics;

pub use metrics::{BytesSpeed, FlowReport};
