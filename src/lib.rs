//! Disk buffer for telemetry exports
//!
//! Exported batches are appended to time-named files inside one folder per
//! signal type and forwarded to the real exporter later, so data survives
//! network outages and process restarts.

pub mod buffer_file;
pub mod clock;
pub mod codec;
pub mod config;
pub mod drainer;
pub mod errors;
pub mod folder;
pub mod iterator;
pub mod queue;
pub mod stats;
pub mod storage;
pub mod telemetry;
pub mod transport;

pub use buffer_file::ProcessResult;
pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{Deserializer, ExportCallback, Forwarder, JsonCodec, NoopCallback, Serializer};
pub use config::{Config, StorageConfig};
pub use drainer::{Drain, DrainReport, DrainScheduler};
pub use errors::{BufferError, FileError, Result};
pub use folder::{BufferFileInfo, FolderManager};
pub use iterator::DrainIterator;
pub use queue::{BufferedQueue, BufferedQueueBuilder};
pub use storage::{ReadOutcome, Storage};
pub use telemetry::{LogEntry, LogLevel, MetricPoint, SignalType, TraceSpan};
pub use transport::HttpForwarder;
