//! Rotating file sink
//!
//! Writes separator-framed payloads to files resolved from a path
//! template. Time tokens (`%Y %m %d %H %M %S %NS`), the payload kind
//! (`%t`) and the per-request UUID (`%r`) are expanded on every write; a
//! change in the resolved name rotates to a new file. In non-append mode
//! chunks carry a `_<N>` index before the extension, picked up from
//! whatever siblings already exist on disk.

use super::PayloadWrite;
use crate::config::defaults::DEFAULT_FILE_QUEUE_LIMIT;
use crate::error::{ReflowError, Result};
use crate::payload::{PayloadMeta, PAYLOAD_SEPARATOR};
use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

/// File sink settings
#[derive(Debug, Clone)]
pub struct FileSinkConfig {
    /// Interval of the periodic flush task
    pub flush_interval: Duration,
    /// Append to the resolved file instead of rotating indexed chunks
    pub append: bool,
    /// Rotate when the current chunk's flushed size reaches this (0 = off)
    pub size_limit: i64,
    /// Rotate after this many messages (0 = off)
    pub queue_limit: usize,
    /// Terminate the sink when total written bytes reach this (0 = off)
    pub max_size: i64,
}

impl Default for FileSinkConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            append: false,
            size_limit: 32 << 20,
            queue_limit: DEFAULT_FILE_QUEUE_LIMIT,
            max_size: 1 << 40,
        }
    }
}

impl FileSinkConfig {
    pub fn with_append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    pub fn with_size_limit(mut self, limit: i64) -> Self {
        self.size_limit = limit;
        self
    }

    pub fn with_queue_limit(mut self, limit: usize) -> Self {
        self.queue_limit = limit;
        self
    }

    pub fn with_max_size(mut self, max: i64) -> Self {
        self.max_size = max;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }
}

enum ChunkWriter {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<File>),
}

impl ChunkWriter {
    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            ChunkWriter::Plain(w) => w.write_all(data),
            ChunkWriter::Gzip(w) => w.write_all(data),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            ChunkWriter::Plain(w) => w.flush(),
            ChunkWriter::Gzip(w) => w.flush(),
        }
    }

    fn finish(self) -> std::io::Result<()> {
        match self {
            ChunkWriter::Plain(mut w) => w.flush(),
            ChunkWriter::Gzip(w) => w.finish().map(|_| ()),
        }
    }
}

struct FileState {
    current_name: String,
    open_name: Option<String>,
    writer: Option<ChunkWriter>,
    queue_length: usize,
    chunk_size: u64,
    total_size: i64,
    current_id: Vec<u8>,
    payload_kind: u8,
    closed: bool,
}

/// Separator-framed payload file writer with rotation
pub struct FileSink {
    path_template: String,
    request_per_file: bool,
    tracks_kind: bool,
    config: FileSinkConfig,
    state: Mutex<FileState>,
}

impl FileSink {
    pub fn new(path_template: impl Into<String>, config: FileSinkConfig) -> Self {
        let path_template = path_template.into();
        Self {
            request_per_file: path_template.contains("%r"),
            tracks_kind: path_template.contains("%t"),
            path_template,
            config,
            state: Mutex::new(FileState {
                current_name: String::new(),
                open_name: None,
                writer: None,
                queue_length: 0,
                chunk_size: 0,
                total_size: 0,
                current_id: Vec::new(),
                payload_kind: 0,
                closed: false,
            }),
        }
    }

    /// Spawn the periodic flush task: refreshes the resolved name so time
    /// tokens rotate, then pushes buffered bytes out
    pub fn spawn_flusher(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let sink = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sink.config.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        if sink.is_closed() {
                            break;
                        }
                        sink.update_name();
                        sink.flush();
                    }
                }
            }
        });
    }

    /// Resolve the template against the current time, payload identity and
    /// on-disk siblings, and remember the result
    pub fn update_name(&self) {
        let mut state = self.state.lock();
        state.current_name = self.resolve_name(&state);
    }

    /// The file name the next write would land in
    pub fn current_name(&self) -> String {
        self.state.lock().current_name.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn resolve_name(&self, state: &FileState) -> String {
        let now = chrono::Local::now();
        let mut path = self.path_template.clone();
        path = path.replace("%NS", &now.timestamp_subsec_nanos().to_string());
        path = path.replace("%Y", &now.format("%Y").to_string());
        path = path.replace("%m", &now.format("%m").to_string());
        path = path.replace("%d", &now.format("%d").to_string());
        path = path.replace("%H", &now.format("%H").to_string());
        path = path.replace("%M", &now.format("%M").to_string());
        path = path.replace("%S", &now.format("%S").to_string());
        path = path.replace("%r", &String::from_utf8_lossy(&state.current_id));
        path = path.replace("%t", &(state.payload_kind as char).to_string());

        if self.config.append {
            return path;
        }

        let next_chunk = state.current_name.is_empty()
            || (self.config.queue_limit > 0 && state.queue_length >= self.config.queue_limit)
            || (self.config.size_limit > 0 && state.chunk_size >= self.config.size_limit as u64);

        let mut siblings = list_siblings(&path);
        if siblings.is_empty() {
            return set_file_index(&path, 0);
        }
        sort_by_file_index(&mut siblings);

        let last = match siblings.last() {
            Some(l) => l.clone(),
            None => return set_file_index(&path, 0),
        };
        let mut index = get_file_index(&last);
        if index == -1 {
            index = 0;
        } else if next_chunk {
            index += 1;
        }
        set_file_index(&last, index)
    }

    fn rotate(&self, state: &mut FileState) -> Result<()> {
        if let Some(old) = state.writer.take() {
            if let Err(e) = old.finish() {
                warn!(error = %e, "error closing rotated chunk");
            }
        }

        let name = state.current_name.clone();
        if let Some(parent) = Path::new(&name).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .map_err(|e| ReflowError::sink("rotate", format!("{}: {}", name, e)))?;
            }
        }

        let file = if self.config.append {
            OpenOptions::new().append(true).create(true).open(&name)
        } else {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&name)
        }
        .map_err(|e| ReflowError::sink("open", format!("{}: {}", name, e)))?;

        state.writer = Some(if name.ends_with(".gz") {
            ChunkWriter::Gzip(GzEncoder::new(file, Compression::default()))
        } else {
            ChunkWriter::Plain(BufWriter::new(file))
        });
        state.open_name = Some(name.clone());
        state.queue_length = 0;
        state.chunk_size = 0;
        debug!(file = %name, "opened output chunk");
        Ok(())
    }

    /// Flush buffered bytes and refresh the flushed-size counter.
    ///
    /// A panic here must not take the process down: one corrupt file is a
    /// skipped flush, not a crash.
    pub fn flush(&self) {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.flush_inner()));
        match outcome {
            Ok(Err(e)) => warn!(error = %e, "file flush failed"),
            Err(_) => error!("panic during file flush"),
            Ok(Ok(())) => {}
        }
    }

    fn flush_inner(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(writer) = state.writer.as_mut() {
            writer.flush()?;
        }
        if let Some(name) = state.open_name.clone() {
            if let Ok(meta) = fs::metadata(&name) {
                state.chunk_size = meta.len();
            }
        }
        Ok(())
    }

    fn close_inner(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        if let Some(writer) = state.writer.take() {
            writer.finish()?;
        }
        Ok(())
    }
}

#[async_trait]
impl PayloadWrite for FileSink {
    async fn write(&self, payload: Bytes) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ReflowError::sink("write", "file sink is closed"));
        }

        if self.request_per_file || self.tracks_kind {
            match PayloadMeta::parse(&payload) {
                Some(meta) => {
                    state.current_id = meta.uuid.to_vec();
                    state.payload_kind = meta.kind.as_byte();
                }
                None => {
                    debug!("skipping malformed payload in file sink");
                    return Ok(());
                }
            }
        }

        state.current_name = self.resolve_name(&state);
        if state.writer.is_none() || state.open_name.as_deref() != Some(&state.current_name) {
            self.rotate(&mut state)?;
        }

        if let Some(writer) = state.writer.as_mut() {
            writer.write_all(&payload)?;
            writer.write_all(PAYLOAD_SEPARATOR)?;
        }
        state.total_size += (payload.len() + PAYLOAD_SEPARATOR.len()) as i64;
        state.queue_length += 1;

        if self.config.max_size > 0 && state.total_size >= self.config.max_size {
            return Err(ReflowError::FileSizeLimit(self.config.max_size));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_inner()
    }

    fn kind(&self) -> &'static str {
        "file"
    }
}

/// Extension of the final path component, like `.gz`, or empty
fn file_ext(name: &str) -> &str {
    let base = name.rsplit('/').next().unwrap_or(name);
    match base.rfind('.') {
        Some(i) if i > 0 => &base[i..],
        _ => "",
    }
}

/// Numeric `_<N>` index before the extension, `-1` when absent
pub fn get_file_index(name: &str) -> i64 {
    let ext = file_ext(name);
    let without_ext = &name[..name.len() - ext.len()];
    match without_ext.rfind('_') {
        Some(i) => without_ext[i + 1..].parse().unwrap_or(-1),
        None => -1,
    }
}

/// Insert or replace the `_<N>` index immediately before the extension
pub fn set_file_index(name: &str, index: i64) -> String {
    let ext = file_ext(name);
    let mut without_ext = &name[..name.len() - ext.len()];
    if let Some(i) = without_ext.rfind('_') {
        if without_ext[i + 1..].parse::<i64>().is_ok() {
            without_ext = &without_ext[..i];
        }
    }
    format!("{}_{}{}", without_ext, index, ext)
}

fn without_index(name: &str) -> &str {
    match name.rfind('_') {
        Some(i) => &name[..i],
        None => name,
    }
}

/// Order indexed siblings by (name without index, numeric index)
pub fn sort_by_file_index(files: &mut [String]) {
    files.sort_by(|a, b| {
        if without_index(a) == without_index(b) {
            get_file_index(a).cmp(&get_file_index(b))
        } else {
            a.cmp(b)
        }
    });
}

/// Existing files next to `path` that share its stem and extension
fn list_siblings(path: &str) -> Vec<String> {
    let ext = file_ext(path);
    let without_ext = &path[..path.len() - ext.len()];
    let (dir, stem) = match without_ext.rfind('/') {
        Some(i) => (&without_ext[..i + 1], &without_ext[i + 1..]),
        None => ("", without_ext),
    };

    let read_dir = match fs::read_dir(if dir.is_empty() { "." } else { dir }) {
        Ok(rd) => rd,
        Err(_) => return Vec::new(),
    };

    let mut out = Vec::new();
    for entry in read_dir.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(stem) && name.ends_with(ext) {
            out.push(format!("{}{}", dir, name));
        }
    }
    out
}
