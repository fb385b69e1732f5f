//! Packet-to-message reassembly
//!
//! A [`Reassembler`] owns the flow table for one capture source and turns
//! out-of-order TCP segments into complete, envelope-tagged HTTP payloads.
//! It is single-threaded by construction: one task owns all state, so flow
//! access needs no locks, and events within a source are serialized.
//!
//! Requests are emitted the moment their framing completes; responses are
//! paired to requests through the ack/seq indices in [`PairingTable`] and
//! inherit the request UUID. Partial messages are flushed or discarded by
//! a periodic expiry tick.

mod message;
mod pairing;

pub use message::{Framing, TcpMessage};
pub use pairing::{PairingTable, PendingResponse, RequestRecord};

use crate::capture::{Direction, FlowKey, TcpPacket};
use crate::config::defaults::DEFAULT_EXPIRE;
use crate::error::{ReflowError, Result};
use crate::payload::{self, PayloadKind, ZERO_UUID};
use crate::proto;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Reassembler settings
#[derive(Debug, Clone)]
pub struct ReassemblyConfig {
    /// Inactivity window after which partial messages are force-completed
    /// (close-terminated) or discarded
    pub expire: Duration,
    /// Emit responses in addition to requests
    pub track_responses: bool,
    /// How long a request declaring `Expect: 100-continue` waits for a 1xx
    /// before completing anyway
    pub continue_deadline: Duration,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        let expire = DEFAULT_EXPIRE;
        Self {
            expire,
            track_responses: true,
            continue_deadline: expire,
        }
    }
}

impl ReassemblyConfig {
    pub fn new(expire: Duration, track_responses: bool) -> Self {
        Self {
            expire,
            track_responses,
            continue_deadline: expire,
        }
    }
}

/// Counters exposed for logging
#[derive(Debug, Clone, Copy, Default)]
pub struct ReassemblerStats {
    pub packets: u64,
    pub emitted: u64,
    pub expired: u64,
    pub malformed: u64,
    pub orphaned: u64,
}

#[derive(Debug)]
struct FlowSlots {
    incoming: Option<TcpMessage>,
    outgoing: Option<TcpMessage>,
    /// A 1xx response was absorbed on this flow; releases a held
    /// 100-continue request
    continue_seen: bool,
    /// End-of-message seqs of the last completed message per direction;
    /// stale retransmissions below them are dropped
    consumed_incoming: Option<u32>,
    consumed_outgoing: Option<u32>,
    last_seen: Instant,
}

impl Default for FlowSlots {
    fn default() -> Self {
        Self {
            incoming: None,
            outgoing: None,
            continue_seen: false,
            consumed_incoming: None,
            consumed_outgoing: None,
            last_seen: Instant::now(),
        }
    }
}

/// Per-capture-source reassembly state machine
pub struct Reassembler {
    config: ReassemblyConfig,
    ports: HashSet<u16>,
    flows: HashMap<FlowKey, FlowSlots>,
    pairing: PairingTable,
    out: mpsc::Sender<Bytes>,
    stats: ReassemblerStats,
}

impl Reassembler {
    pub fn new(config: ReassemblyConfig, ports: HashSet<u16>, out: mpsc::Sender<Bytes>) -> Self {
        Self {
            config,
            ports,
            flows: HashMap::new(),
            pairing: PairingTable::default(),
            out,
            stats: ReassemblerStats::default(),
        }
    }

    pub fn stats(&self) -> ReassemblerStats {
        self.stats
    }

    /// Number of flows with reassembly state (for tests and logging)
    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn pairing_entries(&self) -> (usize, usize) {
        (self.pairing.request_count(), self.pairing.pending_count())
    }

    /// Feed one decoded packet through the state machine
    pub async fn handle_packet(&mut self, packet: TcpPacket) -> Result<()> {
        self.stats.packets += 1;
        let mut next = Some(packet);
        while let Some(p) = next.take() {
            next = self.process_packet(p).await?;
        }
        Ok(())
    }

    async fn process_packet(&mut self, p: TcpPacket) -> Result<Option<TcpPacket>> {
        let direction = match p.direction(&self.ports) {
            Some(d) => d,
            None => return Ok(None),
        };
        let key = p.flow_key(direction);

        if p.flags.rst {
            if self.flows.remove(&key).is_some() {
                debug!(flow = %key, "flow torn down by RST");
            }
            return Ok(None);
        }

        // A 1xx head is absorbed at packet granularity: never emitted,
        // never paired, and it releases a held 100-continue request.
        if direction == Direction::Outgoing && is_informational_head(&p.data) {
            let remainder = split_after_empty_line(&p);
            let released = {
                let slots = self.flows.entry(key).or_default();
                slots.last_seen = Instant::now();
                slots.continue_seen = true;
                let ready = slots
                    .incoming
                    .as_mut()
                    .map(|m| m.awaiting_continue && m.is_framing_complete())
                    .unwrap_or(false);
                if ready {
                    slots.continue_seen = false;
                    let msg = slots.incoming.take();
                    slots.consumed_incoming = msg.as_ref().map(|m| m.next_seq());
                    msg
                } else {
                    None
                }
            };
            if let Some(msg) = released {
                self.finish_request(msg).await?;
            }
            return Ok(remainder);
        }

        let mut finished_request = None;
        let mut finished_response = None;
        {
            let slots = self.flows.entry(key).or_default();
            slots.last_seen = Instant::now();

            if !p.data.is_empty() {
                let (slot, consumed) = match direction {
                    Direction::Incoming => (&mut slots.incoming, slots.consumed_incoming),
                    Direction::Outgoing => (&mut slots.outgoing, slots.consumed_outgoing),
                };
                match slot {
                    Some(msg) => msg.insert(&p),
                    None => {
                        if consumed.map(|b| message::seq_before(p.seq, b)) == Some(true) {
                            debug!(seq = p.seq, "dropping segment below consumed boundary");
                            return Ok(None);
                        }
                        let mut msg = TcpMessage::new(direction, &p);
                        if direction == Direction::Incoming {
                            msg.uuid = payload::uuid();
                        }
                        *slot = Some(msg);
                    }
                }

                if let Some(msg) = slot.as_mut() {
                    if msg.malformed {
                        self.stats.malformed += 1;
                        *slot = None;
                    } else if direction == Direction::Outgoing
                        && msg.headers_seen
                        && matches!(
                            msg.framing,
                            Framing::ContentLength(_) | Framing::CloseTerminated
                        )
                        && self.pairing.peek_request(msg.ack).map(|r| r.is_head) == Some(true)
                    {
                        msg.force_empty_body();
                    }
                }
            }

            // FIN ends the close-terminated message of its direction
            if p.flags.fin {
                let slot = match direction {
                    Direction::Incoming => &mut slots.incoming,
                    Direction::Outgoing => &mut slots.outgoing,
                };
                let closeable = slot
                    .as_ref()
                    .map(|m| m.headers_seen && m.framing == Framing::CloseTerminated)
                    .unwrap_or(false);
                if closeable {
                    let msg = slot.take();
                    match direction {
                        Direction::Incoming => finished_request = msg,
                        Direction::Outgoing => finished_response = msg,
                    }
                }
            }

            match direction {
                Direction::Incoming => {
                    let continue_seen = slots.continue_seen;
                    let ready = slots
                        .incoming
                        .as_mut()
                        .map(|m| {
                            m.is_framing_complete() && (!m.awaiting_continue || continue_seen)
                        })
                        .unwrap_or(false);
                    if ready {
                        slots.continue_seen = false;
                        let msg = slots.incoming.take();
                        slots.consumed_incoming = msg.as_ref().map(|m| m.next_seq());
                        finished_request = msg;
                    } else if slots.incoming.as_ref().map(|m| m.malformed) == Some(true) {
                        self.stats.malformed += 1;
                        slots.incoming = None;
                    }
                }
                Direction::Outgoing => {
                    let ready = slots
                        .outgoing
                        .as_mut()
                        .map(|m| m.is_framing_complete())
                        .unwrap_or(false);
                    if ready {
                        let msg = slots.outgoing.take();
                        slots.consumed_outgoing = msg.as_ref().map(|m| m.next_seq());
                        finished_response = msg;
                    } else if slots.outgoing.as_ref().map(|m| m.malformed) == Some(true) {
                        self.stats.malformed += 1;
                        slots.outgoing = None;
                    }
                }
            }
        }

        if let Some(msg) = finished_request {
            self.finish_request(msg).await?;
        }
        if let Some(msg) = finished_response {
            self.finish_response(msg).await?;
        }
        Ok(None)
    }

    /// Emit a completed request and wire up pairing for its response
    async fn finish_request(&mut self, msg: TcpMessage) -> Result<()> {
        let next_seq = msg.next_seq();
        let bytes = msg.emit_bytes();
        let record = RequestRecord::new(msg.uuid.clone(), msg.started_at, msg.is_head);

        self.emit(payload::encode(
            PayloadKind::Request,
            &msg.uuid,
            msg.started_at,
            -1,
            &bytes,
        ))
        .await?;

        if let Some(pending) = self.pairing.take_pending(next_seq) {
            let extra = (pending.nanos - record.nanos).max(0);
            if self.config.track_responses {
                self.emit(payload::encode(
                    PayloadKind::Response,
                    &record.uuid,
                    pending.nanos,
                    extra,
                    &pending.bytes,
                ))
                .await?;
            }
        } else {
            self.pairing.register_request(next_seq, record);
        }
        Ok(())
    }

    /// Emit a completed response, pairing it with its request when known
    async fn finish_response(&mut self, msg: TcpMessage) -> Result<()> {
        if !msg.headers_seen {
            self.stats.expired += 1;
            return Ok(());
        }
        let bytes = msg.joined();
        match self.pairing.take_request(msg.ack) {
            Some(req) => {
                let extra = (msg.started_at - req.nanos).max(0);
                if self.config.track_responses {
                    self.emit(payload::encode(
                        PayloadKind::Response,
                        &req.uuid,
                        msg.started_at,
                        extra,
                        &bytes,
                    ))
                    .await?;
                }
            }
            None => {
                if self.config.track_responses {
                    self.pairing
                        .stash_response(msg.ack, PendingResponse::new(bytes, msg.started_at));
                }
            }
        }
        Ok(())
    }

    async fn emit(&mut self, payload: Bytes) -> Result<()> {
        self.out
            .send(payload)
            .await
            .map_err(|_| ReflowError::ShuttingDown)?;
        self.stats.emitted += 1;
        Ok(())
    }

    /// Expiry sweep: force-complete close-terminated messages, release
    /// overdue 100-continue holds, discard the rest, flush orphans
    pub async fn tick(&mut self) -> Result<()> {
        let expire = self.config.expire;
        let continue_deadline = self.config.continue_deadline;
        let mut finished_requests = Vec::new();
        let mut finished_responses = Vec::new();

        for slots in self.flows.values_mut() {
            let release = slots
                .incoming
                .as_mut()
                .map(|m| {
                    m.awaiting_continue
                        && m.last_packet_at.elapsed() >= continue_deadline
                        && m.is_framing_complete()
                })
                .unwrap_or(false);
            if release {
                slots.continue_seen = false;
                if let Some(msg) = slots.incoming.take() {
                    slots.consumed_incoming = Some(msg.next_seq());
                    finished_requests.push(msg);
                }
            } else if slots
                .incoming
                .as_ref()
                .map(|m| m.last_packet_at.elapsed() >= expire)
                == Some(true)
            {
                self.stats.expired += 1;
                slots.incoming = None;
            }

            if slots
                .outgoing
                .as_ref()
                .map(|m| m.last_packet_at.elapsed() >= expire)
                == Some(true)
            {
                if let Some(msg) = slots.outgoing.take() {
                    if msg.headers_seen && msg.framing == Framing::CloseTerminated {
                        slots.consumed_outgoing = Some(msg.next_seq());
                        finished_responses.push(msg);
                    } else {
                        self.stats.expired += 1;
                    }
                }
            }
        }

        self.flows.retain(|_, s| {
            s.incoming.is_some() || s.outgoing.is_some() || s.last_seen.elapsed() < expire * 4
        });

        for msg in finished_requests {
            self.finish_request(msg).await?;
        }
        for msg in finished_responses {
            self.finish_response(msg).await?;
        }

        for pending in self.pairing.sweep(expire) {
            self.stats.orphaned += 1;
            if self.config.track_responses {
                debug!("flushing response without a matched request");
                self.emit(payload::encode(
                    PayloadKind::Response,
                    ZERO_UUID,
                    pending.nanos,
                    0,
                    &pending.bytes,
                ))
                .await?;
            }
        }
        Ok(())
    }

    /// Drive the state machine from a packet channel until shutdown
    pub async fn run(
        mut self,
        mut packets: mpsc::Receiver<TcpPacket>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let period = (self.config.expire / 4).max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                maybe = packets.recv() => match maybe {
                    Some(p) => {
                        if let Err(ReflowError::ShuttingDown) = self.handle_packet(p).await {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "expiry tick failed");
                        break;
                    }
                }
            }
        }

        let stats = self.stats;
        info!(
            packets = stats.packets,
            emitted = stats.emitted,
            expired = stats.expired,
            malformed = stats.malformed,
            "reassembler stopped"
        );
        Ok(())
    }
}

/// True when the data opens with a 1xx status line
fn is_informational_head(data: &[u8]) -> bool {
    if !data.starts_with(b"HTTP/") {
        return false;
    }
    matches!(proto::status_code(data), Some(code) if (100..200).contains(&code))
}

/// Split the bytes of an absorbed 1xx head: anything past its empty line
/// continues as a fresh segment
fn split_after_empty_line(p: &TcpPacket) -> Option<TcpPacket> {
    let consumed = proto::empty_line_offset(&p.data)? + 4;
    if consumed >= p.data.len() {
        return None;
    }
    let mut rest = p.clone();
    rest.seq = p.seq.wrapping_add(consumed as u32);
    rest.data = p.data.slice(consumed..);
    Some(rest)
}
