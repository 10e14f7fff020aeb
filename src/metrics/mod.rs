pub mod hub;
pub mod parser;
pub mod sink;

pub use hub::{MetricsHub, Subscription};
pub use sink::MetricSink;
