/// Log file reporters: classification, counting and rate-limited delivery
pub mod log_reporter;

pub use log_reporter::{
    EventSink, LogFormat, LogReporter, RateLimit, ReportPipeline, ReporterSettings, ReporterStats,
};
