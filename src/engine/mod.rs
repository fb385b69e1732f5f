//! Pipeline assembly and lifecycle
//!
//! The engine builds every configured source and sink, spawns one copy
//! task per input (plus one per sink that also produces payloads, like
//! the replay output), and owns the shutdown broadcast. The topology is a
//! directed graph, not a pipeline: replayed responses re-enter the same
//! emitter fan-out as captured traffic.

use crate::capture::TcpPacket;
use crate::config::defaults::PIPELINE_QUEUE_LEN;
use crate::config::AppConfig;
use crate::emitter::{copy_multi, EmitterConfig, HttpModifier, ModifierConfig};
use crate::error::{ReflowError, Result};
use crate::reassembly::{Reassembler, ReassemblyConfig};
use crate::replay::{ReplayConfig, ReplaySink};
use crate::sink::{FileSink, FileSinkConfig, NullSink, PayloadWrite, StdoutSink, TcpSink, TcpSinkConfig};
use crate::source::{FileSource, TcpSource, TcpSourceConfig};
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{error, info, warn};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Assembles and runs the capture/replay pipeline
pub struct Engine {
    config: AppConfig,
    shutdown: broadcast::Sender<()>,
    packet_feeds: Vec<mpsc::Receiver<TcpPacket>>,
}

impl Engine {
    pub fn new(config: AppConfig) -> Self {
        let (shutdown, _) = broadcast::channel(8);
        Self {
            config,
            shutdown,
            packet_feeds: Vec::new(),
        }
    }

    /// Handle other tasks (signal handlers, embedders) use to stop the
    /// engine
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    /// Attach a decoded-packet feed for a `--input-raw` capture source.
    /// The capture driver itself lives outside this crate.
    pub fn attach_capture(&mut self, packets: mpsc::Receiver<TcpPacket>) {
        self.packet_feeds.push(packets);
    }

    /// Run until every input ends, a fatal error occurs, `exit_after`
    /// elapses or the shutdown handle fires. Sinks are flushed and closed
    /// on the way out.
    pub async fn run(mut self) -> Result<()> {
        if !self.config.has_io() {
            return Err(ReflowError::Config(
                "required at least 1 input and 1 output".to_string(),
            ));
        }
        if !self.config.capture.ports.is_empty() && self.packet_feeds.is_empty() {
            return Err(ReflowError::config(
                "input-raw",
                "no capture driver attached for the configured ports",
            ));
        }

        let (sinks, response_streams) = self.build_sinks()?;
        let modifier = HttpModifier::new(ModifierConfig::from_settings(&self.config.modifier)?)
            .map(Arc::new);
        let mut streams = self.build_sources().await?;
        streams.extend(response_streams);

        info!(
            inputs = streams.len(),
            outputs = sinks.len(),
            split = self.config.split_output,
            "pipeline started"
        );

        let emitter_config = EmitterConfig {
            split_output: self.config.split_output,
            prettify_http: self.config.prettify_http,
            copy_buffer_size: self.config.copy_buffer_size,
        };

        let mut tasks = JoinSet::new();
        for stream in streams {
            tasks.spawn(copy_multi(
                stream,
                sinks.clone(),
                modifier.clone(),
                emitter_config.clone(),
                self.shutdown.subscribe(),
            ));
        }

        let exit_after = self.config.exit_after;
        let exit_timer = async move {
            match exit_after {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(exit_timer);

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut result = Ok(());
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = &mut exit_timer => {
                    info!("exit-after elapsed, stopping");
                    break;
                }
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => {
                        // a non-fatal error takes down its task, not the pipeline
                        if e.is_fatal() {
                            error!(error = %e, "copy task failed");
                            result = Err(e);
                            break;
                        }
                        warn!(error = %e, "copy task stopped");
                    }
                    Some(Err(e)) => {
                        result = Err(ReflowError::Emitter(format!("copy task panicked: {}", e)));
                        break;
                    }
                },
            }
        }

        let _ = self.shutdown.send(());
        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        let _ = timeout(CLOSE_TIMEOUT, drain).await;

        for sink in &sinks {
            if let Err(e) = timeout(CLOSE_TIMEOUT, sink.close()).await.unwrap_or_else(|_| {
                Err(ReflowError::sink("close", "timed out"))
            }) {
                error!(kind = sink.kind(), error = %e, "sink close failed");
            }
        }

        info!("pipeline stopped");
        result
    }

    #[allow(clippy::type_complexity)]
    fn build_sinks(&self) -> Result<(Vec<Arc<dyn PayloadWrite>>, Vec<mpsc::Receiver<Bytes>>)> {
        let mut sinks: Vec<Arc<dyn PayloadWrite>> = Vec::new();
        let mut response_streams = Vec::new();

        for path in &self.config.output_files {
            let file = &self.config.file;
            let sink = Arc::new(FileSink::new(
                path,
                FileSinkConfig {
                    flush_interval: file.flush_interval,
                    append: file.append,
                    size_limit: file.size_limit,
                    queue_limit: file.queue_limit,
                    max_size: file.max_size,
                },
            ));
            sink.spawn_flusher(self.shutdown.subscribe());
            sinks.push(sink);
        }

        for address in &self.config.output_tcp {
            sinks.push(Arc::new(TcpSink::new(
                TcpSinkConfig::new(address.clone())
                    .with_secure(self.config.output_tcp_secure)
                    .with_sticky(self.config.output_tcp_sticky),
            )));
        }

        for address in &self.config.output_http {
            let replay = &self.config.replay;
            let sink = ReplaySink::new(ReplayConfig {
                address: address.clone(),
                timeout: replay.timeout,
                workers_min: replay.workers_min,
                workers_max: replay.workers_max,
                queue_len: replay.queue_len,
                redirect_limit: replay.redirect_limit,
                track_responses: replay.track_responses,
                original_host: replay.original_host,
                response_buffer_size: replay.response_buffer_size,
                compatibility_mode: replay.compatibility_mode,
                debug: false,
            })?;
            if let Some(rx) = sink.take_responses() {
                response_streams.push(rx);
            }
            sinks.push(Arc::new(sink));
        }

        if self.config.output_stdout {
            sinks.push(Arc::new(StdoutSink));
        }
        if self.config.output_null {
            sinks.push(Arc::new(NullSink));
        }

        Ok((sinks, response_streams))
    }

    async fn build_sources(&mut self) -> Result<Vec<mpsc::Receiver<Bytes>>> {
        let mut streams = Vec::new();

        for path in &self.config.input_files {
            streams.push(
                FileSource::new(path, self.config.input_file_loop)
                    .spawn(self.shutdown.subscribe()),
            );
        }

        for address in &self.config.input_tcp {
            let mut source_config = TcpSourceConfig::new(address.clone());
            if let Some(tls) = &self.config.input_tcp_tls {
                source_config = source_config.with_tls(tls.clone());
            }
            let source = TcpSource::bind(source_config).await?;
            streams.push(source.spawn(self.shutdown.subscribe()));
        }

        let ports: HashSet<u16> = self.config.capture.ports.iter().copied().collect();
        for packets in self.packet_feeds.drain(..) {
            let (tx, rx) = mpsc::channel(PIPELINE_QUEUE_LEN);
            let reassembler = Reassembler::new(
                ReassemblyConfig::new(self.config.capture.expire, self.config.capture.track_responses),
                ports.clone(),
                tx,
            );
            tokio::spawn(reassembler.run(packets, self.shutdown.subscribe()));
            streams.push(rx);
        }

        Ok(streams)
    }
}
