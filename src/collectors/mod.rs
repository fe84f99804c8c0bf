/// Rotation-aware polling of growing files
pub mod tail;

/// Multi-line log entry reassembly
pub mod reassembler;

/// Free disk space monitoring
pub mod disk_monitor;

pub use disk_monitor::{DiskSpaceMonitor, DiskState, DiskUsage};
pub use reassembler::{MessageReassembler, PatternStart, StartDetector, UnindentedStart};
pub use tail::{PollingTail, RawLine, TailCursor, TailMode};
