//! Command-line arguments for Reflow
//!
//! This module defines the CLI arguments structure using clap. Repeatable
//! flags (`--input-file`, `--output-http`, modifier filters) collect into
//! vectors so several inputs and outputs can be wired at once.

use clap::Parser;

/// Command-line arguments for Reflow
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "reflow")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Live HTTP traffic recording and replay engine")]
pub struct ReflowArgs {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "REFLOW_LOG_LEVEL", default_value = super::defaults::DEFAULT_LOG_LEVEL)]
    pub log_level: String,

    /// Exit after the given number of seconds (0 = run forever)
    #[arg(long, default_value_t = 0)]
    pub exit_after: u64,

    /// Split traffic equally among outputs instead of copying it to all
    #[arg(long)]
    pub split_output: bool,

    /// Decode gzip bodies and dechunk transfer-encoded messages before
    /// emission. Useful together with --output-stdout
    #[arg(long)]
    pub prettify_http: bool,

    /// Buffer size for an individual payload, e.g. 5mb
    #[arg(long, default_value = "5mb")]
    pub copy_buffer_size: String,

    /// Capture traffic from the given port (requires an attached capture
    /// driver feeding decoded packets)
    #[arg(long = "input-raw")]
    pub input_raw: Vec<String>,

    /// Track responses in addition to requests
    #[arg(long = "input-raw-track-response")]
    pub input_raw_track_response: bool,

    /// How long to wait for the last TCP packet before considering a
    /// message complete, in milliseconds
    #[arg(long = "input-raw-expire", default_value_t = 2000)]
    pub input_raw_expire_ms: u64,

    /// Read payloads from a recorded file (plain or .gz)
    #[arg(long = "input-file")]
    pub input_file: Vec<String>,

    /// Loop input files, useful for performance testing
    #[arg(long = "input-file-loop")]
    pub input_file_loop: bool,

    /// Receive payloads from other Reflow instances on this address
    #[arg(long = "input-tcp")]
    pub input_tcp: Vec<String>,

    /// Enable TLS on the TCP input
    #[arg(long = "input-tcp-secure")]
    pub input_tcp_secure: bool,

    /// Path to a PEM encoded certificate for the TCP input
    #[arg(long = "input-tcp-certificate")]
    pub input_tcp_certificate: Option<String>,

    /// Path to a PEM encoded certificate key for the TCP input
    #[arg(long = "input-tcp-certificate-key")]
    pub input_tcp_certificate_key: Option<String>,

    /// Print payloads coming from inputs to stdout
    #[arg(long = "output-stdout")]
    pub output_stdout: bool,

    /// Drop all payloads (for testing inputs)
    #[arg(long = "output-null")]
    pub output_null: bool,

    /// Write payloads to a file; path may contain %Y %m %d %H %M %S %NS
    /// %t %r tokens and a .gz suffix for compression
    #[arg(long = "output-file")]
    pub output_file: Vec<String>,

    /// Interval for forcing buffer flush to the file, in milliseconds
    #[arg(long = "output-file-flush-interval", default_value_t = 1000)]
    pub output_file_flush_interval_ms: u64,

    /// Append to existing files instead of rotating chunks
    #[arg(long = "output-file-append")]
    pub output_file_append: bool,

    /// Size of each chunk before rotation, e.g. 32mb
    #[arg(long = "output-file-size-limit", default_value = "32mb")]
    pub output_file_size_limit: String,

    /// Number of messages per chunk before rotation
    #[arg(long = "output-file-queue-limit", default_value_t = 256)]
    pub output_file_queue_limit: usize,

    /// Hard cap on total output file size, e.g. 1tb
    #[arg(long = "output-file-max-size-limit", default_value = "1tb")]
    pub output_file_max_size: String,

    /// Forward payloads to other Reflow instances on this address
    #[arg(long = "output-tcp")]
    pub output_tcp: Vec<String>,

    /// Use a TLS connection for the TCP output
    #[arg(long = "output-tcp-secure")]
    pub output_tcp_secure: bool,

    /// Payloads with the same ID are sent over the same connection
    #[arg(long = "output-tcp-sticky")]
    pub output_tcp_sticky: bool,

    /// Forward incoming requests to the given HTTP address
    #[arg(long = "output-http")]
    pub output_http: Vec<String>,

    /// HTTP request/response timeout in milliseconds
    #[arg(long = "output-http-timeout", default_value_t = 5000)]
    pub output_http_timeout_ms: u64,

    /// Minimum number of replay workers kept alive by dynamic scaling
    #[arg(long = "output-http-workers-min", default_value_t = 1)]
    pub output_http_workers_min: usize,

    /// Maximum number of replay workers (0 = unlimited)
    #[arg(long = "output-http-workers", default_value_t = 0)]
    pub output_http_workers_max: usize,

    /// Number of requests that can queue for replay when workers are busy
    #[arg(long = "output-http-queue-len", default_value_t = 1000)]
    pub output_http_queue_len: usize,

    /// How many redirects to follow (0 = none)
    #[arg(long = "output-http-redirects", default_value_t = 0)]
    pub output_http_redirects: usize,

    /// Replayed responses are fed back to all outputs
    #[arg(long = "output-http-track-response")]
    pub output_http_track_response: bool,

    /// Preserve the original Host header instead of the replay target host
    #[arg(long = "http-original-host")]
    pub http_original_host: bool,

    /// HTTP response buffer size; data beyond it is discarded
    #[arg(long = "output-http-response-buffer", default_value_t = 0)]
    pub output_http_response_buffer: usize,

    /// Parse requests into a structured form and dispatch via a tolerant
    /// client path instead of raw byte forwarding
    #[arg(long = "output-http-compatibility-mode")]
    pub output_http_compatibility_mode: bool,

    /// Whitelist of HTTP methods to replay; anything else is dropped
    #[arg(long = "http-allow-method")]
    pub http_allow_method: Vec<String>,

    /// Regexp matched against the full URL; non-matching requests dropped
    #[arg(long = "http-allow-url")]
    pub http_allow_url: Vec<String>,

    /// Regexp matched against the full URL; matching requests dropped
    #[arg(long = "http-disallow-url")]
    pub http_disallow_url: Vec<String>,

    /// `header:regexp`: requests whose header does not match are dropped
    #[arg(long = "http-allow-header")]
    pub http_allow_header: Vec<String>,

    /// `header:regexp`: requests whose header matches are dropped
    #[arg(long = "http-disallow-header")]
    pub http_disallow_header: Vec<String>,

    /// Regexp matched against the decoded basic auth credential
    #[arg(long = "http-basic-auth-filter")]
    pub http_basic_auth_filter: Vec<String>,

    /// `header: regexp,replacement`: rewrite a request header
    #[arg(long = "http-rewrite-header")]
    pub http_rewrite_header: Vec<String>,

    /// `regexp:replacement`: rewrite the request URL
    #[arg(long = "http-rewrite-url")]
    pub http_rewrite_url: Vec<String>,

    /// `Header: value`: inject or overwrite a request header
    #[arg(long = "http-set-header")]
    pub http_set_header: Vec<String>,

    /// `param=value`: set a request URL parameter
    #[arg(long = "http-set-param")]
    pub http_set_param: Vec<String>,

    /// `header:percent%`: keep a consistent fraction of requests by the
    /// FNV-1a hash of a header value
    #[arg(long = "http-header-limiter")]
    pub http_header_limiter: Vec<String>,

    /// `param:percent%`: keep a consistent fraction of requests by the
    /// FNV-1a hash of a URL parameter value
    #[arg(long = "http-param-limiter")]
    pub http_param_limiter: Vec<String>,
}
