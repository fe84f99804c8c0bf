/// Alert aggregation with settle delay and cooldown
pub mod event_aggregator;

pub use event_aggregator::{AggregationBuffer, AlertAggregator, Condition};
