//! Default constants for Reflow configuration

use std::time::Duration;

/// Default log level when RUST_LOG is not set
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// How long to wait for the last TCP packet before a partial message is
/// force-completed or dropped
pub const DEFAULT_EXPIRE: Duration = Duration::from_secs(2);

/// Interval for forcing file sink buffer flushes
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Default size of each file chunk before rotation
pub const DEFAULT_FILE_SIZE_LIMIT: &str = "32mb";

/// Default hard cap for total file output
pub const DEFAULT_FILE_MAX_SIZE: &str = "1tb";

/// Default number of messages per chunk before rotation
pub const DEFAULT_FILE_QUEUE_LIMIT: usize = 256;

/// Default per-payload copy buffer size
pub const DEFAULT_COPY_BUFFER_SIZE: &str = "5mb";

/// Default replay request/response timeout
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Replay response buffer size when not configured
pub const DEFAULT_RESPONSE_BUFFER_SIZE: usize = 100 * 1024;

/// Number of payloads that can queue for the replay output before
/// backpressure reaches the emitter
pub const DEFAULT_REPLAY_QUEUE_LEN: usize = 1000;

/// Workers started by the dynamic replay pool before scaling kicks in
pub const INITIAL_DYNAMIC_WORKERS: usize = 10;

/// A dynamically scaled replay worker dies after this much idleness
pub const WORKER_IDLE_DEATH: Duration = Duration::from_secs(2);

/// Number of TCP sink workers (and sticky buckets)
pub const TCP_SINK_WORKERS: usize = 10;

/// Per-channel queue depth of the sticky TCP sink
pub const TCP_STICKY_QUEUE_LEN: usize = 100;

/// Queue depth of the shared non-sticky TCP sink channel
pub const TCP_SHARED_QUEUE_LEN: usize = 1000;

/// Delay between TCP sink reconnect attempts
pub const TCP_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Capacity of the channels linking sources, emitter and sinks
pub const PIPELINE_QUEUE_LEN: usize = 1024;
