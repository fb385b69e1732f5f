//! Configuration module for Reflow
//!
//! This module is organized into submodules:
//! - `defaults` - Default constants and values
//! - `args` - CLI argument definitions
//! - `limits` - Byte-size parsing for buffer and file limits
//!
//! Configuration is loaded once at startup into an immutable [`AppConfig`]
//! which components receive by reference or clone. There is no runtime
//! mutation.

mod args;
pub mod defaults;
mod limits;

pub use args::ReflowArgs;
pub use defaults::*;
pub use limits::parse_byte_size;

use crate::error::{ReflowError, Result};
use std::time::Duration;

/// Raw modifier settings as given on the command line.
///
/// Regex compilation happens when the emitter builds its modifier chain so
/// that invalid expressions surface as configuration errors at startup.
#[derive(Debug, Clone, Default)]
pub struct ModifierSettings {
    pub allow_methods: Vec<String>,
    pub allow_url: Vec<String>,
    pub disallow_url: Vec<String>,
    pub allow_header: Vec<String>,
    pub disallow_header: Vec<String>,
    pub basic_auth_filter: Vec<String>,
    pub rewrite_header: Vec<String>,
    pub rewrite_url: Vec<String>,
    pub set_header: Vec<String>,
    pub set_param: Vec<String>,
    pub header_limiter: Vec<String>,
    pub param_limiter: Vec<String>,
}

impl ModifierSettings {
    /// True when no modifier flag was given at all
    pub fn is_empty(&self) -> bool {
        self.allow_methods.is_empty()
            && self.allow_url.is_empty()
            && self.disallow_url.is_empty()
            && self.allow_header.is_empty()
            && self.disallow_header.is_empty()
            && self.basic_auth_filter.is_empty()
            && self.rewrite_header.is_empty()
            && self.rewrite_url.is_empty()
            && self.set_header.is_empty()
            && self.set_param.is_empty()
            && self.header_limiter.is_empty()
            && self.param_limiter.is_empty()
    }
}

/// Raw capture input settings
#[derive(Debug, Clone, Default)]
pub struct CaptureSettings {
    /// Ports whose traffic is being captured
    pub ports: Vec<u16>,
    /// Inactivity window before a partial message is force-completed
    pub expire: Duration,
    /// Emit responses in addition to requests
    pub track_responses: bool,
}

/// File sink settings shared by all `--output-file` sinks
#[derive(Debug, Clone)]
pub struct FileSettings {
    pub flush_interval: Duration,
    pub append: bool,
    pub size_limit: i64,
    pub queue_limit: usize,
    pub max_size: i64,
}

impl Default for FileSettings {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            append: false,
            size_limit: 32 << 20,
            queue_limit: DEFAULT_FILE_QUEUE_LIMIT,
            max_size: 1 << 40,
        }
    }
}

/// Replay output settings shared by all `--output-http` sinks
#[derive(Debug, Clone)]
pub struct ReplaySettings {
    pub timeout: Duration,
    pub workers_min: usize,
    pub workers_max: usize,
    pub queue_len: usize,
    pub redirect_limit: usize,
    pub track_responses: bool,
    pub original_host: bool,
    pub response_buffer_size: usize,
    pub compatibility_mode: bool,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_HTTP_TIMEOUT,
            workers_min: 1,
            workers_max: 0,
            queue_len: DEFAULT_REPLAY_QUEUE_LEN,
            redirect_limit: 0,
            track_responses: false,
            original_host: false,
            response_buffer_size: DEFAULT_RESPONSE_BUFFER_SIZE,
            compatibility_mode: false,
        }
    }
}

/// Complete process-wide configuration, assembled once at startup
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub exit_after: Option<Duration>,
    pub split_output: bool,
    pub prettify_http: bool,
    pub copy_buffer_size: i64,

    pub capture: CaptureSettings,
    pub input_files: Vec<String>,
    pub input_file_loop: bool,
    pub input_tcp: Vec<String>,
    pub input_tcp_tls: Option<TlsIdentity>,

    pub output_stdout: bool,
    pub output_null: bool,
    pub output_files: Vec<String>,
    pub file: FileSettings,
    pub output_tcp: Vec<String>,
    pub output_tcp_secure: bool,
    pub output_tcp_sticky: bool,
    pub output_http: Vec<String>,
    pub replay: ReplaySettings,

    pub modifier: ModifierSettings,
}

/// Certificate/key pair for TLS-enabled TCP inputs
#[derive(Debug, Clone)]
pub struct TlsIdentity {
    pub cert_path: String,
    pub key_path: String,
}

impl AppConfig {
    /// Build the configuration from parsed CLI arguments.
    ///
    /// Byte-size strings and capture addresses are validated here so that
    /// misconfiguration is fatal before any task starts.
    pub fn from_args(args: ReflowArgs) -> Result<Self> {
        let copy_buffer_size = parse_byte_size(&args.copy_buffer_size, DEFAULT_COPY_BUFFER_SIZE)?;
        let size_limit =
            parse_byte_size(&args.output_file_size_limit, DEFAULT_FILE_SIZE_LIMIT)?;
        let max_size = parse_byte_size(&args.output_file_max_size, DEFAULT_FILE_MAX_SIZE)?;

        let mut ports = Vec::new();
        for addr in &args.input_raw {
            ports.push(parse_capture_port(addr)?);
        }

        let input_tcp_tls = if args.input_tcp_secure {
            match (&args.input_tcp_certificate, &args.input_tcp_certificate_key) {
                (Some(cert), Some(key)) => Some(TlsIdentity {
                    cert_path: cert.clone(),
                    key_path: key.clone(),
                }),
                _ => {
                    return Err(ReflowError::config(
                        "input-tcp-secure",
                        "certificate and key files are required",
                    ))
                }
            }
        } else {
            None
        };

        Ok(Self {
            exit_after: (args.exit_after > 0).then(|| Duration::from_secs(args.exit_after)),
            split_output: args.split_output,
            prettify_http: args.prettify_http,
            copy_buffer_size,
            capture: CaptureSettings {
                ports,
                expire: Duration::from_millis(args.input_raw_expire_ms.max(1)),
                track_responses: args.input_raw_track_response,
            },
            input_files: args.input_file,
            input_file_loop: args.input_file_loop,
            input_tcp: args.input_tcp,
            input_tcp_tls,
            output_stdout: args.output_stdout,
            output_null: args.output_null,
            output_files: args.output_file,
            file: FileSettings {
                flush_interval: Duration::from_millis(args.output_file_flush_interval_ms.max(1)),
                append: args.output_file_append,
                size_limit,
                queue_limit: args.output_file_queue_limit,
                max_size,
            },
            output_tcp: args.output_tcp,
            output_tcp_secure: args.output_tcp_secure,
            output_tcp_sticky: args.output_tcp_sticky,
            output_http: args.output_http,
            replay: ReplaySettings {
                timeout: Duration::from_millis(args.output_http_timeout_ms.max(1)),
                workers_min: args.output_http_workers_min.max(1),
                workers_max: args.output_http_workers_max,
                queue_len: args.output_http_queue_len.max(1),
                redirect_limit: args.output_http_redirects,
                track_responses: args.output_http_track_response,
                original_host: args.http_original_host,
                response_buffer_size: if args.output_http_response_buffer == 0 {
                    DEFAULT_RESPONSE_BUFFER_SIZE
                } else {
                    args.output_http_response_buffer
                },
                compatibility_mode: args.output_http_compatibility_mode,
            },
            modifier: ModifierSettings {
                allow_methods: args.http_allow_method,
                allow_url: args.http_allow_url,
                disallow_url: args.http_disallow_url,
                allow_header: args.http_allow_header,
                disallow_header: args.http_disallow_header,
                basic_auth_filter: args.http_basic_auth_filter,
                rewrite_header: args.http_rewrite_header,
                rewrite_url: args.http_rewrite_url,
                set_header: args.http_set_header,
                set_param: args.http_set_param,
                header_limiter: args.http_header_limiter,
                param_limiter: args.http_param_limiter,
            },
        })
    }

    /// True when at least one input and one output are configured
    pub fn has_io(&self) -> bool {
        let inputs =
            !self.capture.ports.is_empty() || !self.input_files.is_empty() || !self.input_tcp.is_empty();
        let outputs = self.output_stdout
            || self.output_null
            || !self.output_files.is_empty()
            || !self.output_tcp.is_empty()
            || !self.output_http.is_empty();
        inputs && outputs
    }
}

/// Extract the port from a capture address like `:80` or `0.0.0.0:80`
fn parse_capture_port(addr: &str) -> Result<u16> {
    let port = addr.rsplit(':').next().unwrap_or(addr);
    port.parse::<u16>()
        .map_err(|_| ReflowError::config("input-raw", format!("invalid capture address {:?}", addr)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_port_parsing() {
        assert_eq!(parse_capture_port(":80").unwrap(), 80);
        assert_eq!(parse_capture_port("0.0.0.0:8080").unwrap(), 8080);
        assert_eq!(parse_capture_port("443").unwrap(), 443);
        assert!(parse_capture_port(":http").is_err());
    }

    #[test]
    fn test_from_args_defaults() {
        let config = AppConfig::from_args(ReflowArgs::default()).unwrap();
        // empty flag values fall back to their documented defaults
        assert_eq!(config.copy_buffer_size, 5 << 20);
        assert_eq!(config.file.size_limit, 32 << 20);
        assert!(!config.has_io());
        assert!(config.modifier.is_empty());
    }

    #[test]
    fn test_from_args_sizes() {
        let args = ReflowArgs {
            copy_buffer_size: "5mb".to_string(),
            output_file_size_limit: "1kb".to_string(),
            output_file_max_size: "1gb".to_string(),
            ..Default::default()
        };
        let config = AppConfig::from_args(args).unwrap();
        assert_eq!(config.copy_buffer_size, 5 << 20);
        assert_eq!(config.file.size_limit, 1 << 10);
        assert_eq!(config.file.max_size, 1 << 30);
    }

    #[test]
    fn test_secure_input_requires_identity() {
        let args = ReflowArgs {
            input_tcp: vec![":28020".to_string()],
            input_tcp_secure: true,
            ..Default::default()
        };
        assert!(AppConfig::from_args(args).is_err());
    }

    #[test]
    fn test_has_io() {
        let args = ReflowArgs {
            input_file: vec!["requests.rec".to_string()],
            output_stdout: true,
            copy_buffer_size: "5mb".to_string(),
            ..Default::default()
        };
        let config = AppConfig::from_args(args).unwrap();
        assert!(config.has_io());
    }
}
