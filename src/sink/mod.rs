//! Built-in sinks

pub mod fanout;

pub use fanout::{FanoutSink, FanoutSinkFactory};
