//! Decoded TCP packet model
//!
//! The raw capture driver (libpcap, raw sockets) is an external
//! collaborator: whatever it is, it hands the reassembler decoded
//! `(timestamp, addresses, TCP header, payload)` tuples. This module is
//! that boundary: a plain packet struct plus flow/direction derivation.

use bytes::Bytes;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// TCP header flags relevant to reassembly
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub fin: bool,
    pub psh: bool,
    pub rst: bool,
}

/// Traffic direction relative to the captured service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Toward the captured port: a request
    Incoming,
    /// From the captured port: a response
    Outgoing,
}

/// One decoded TCP segment
#[derive(Debug, Clone)]
pub struct TcpPacket {
    pub src_addr: IpAddr,
    pub src_port: u16,
    pub dst_addr: IpAddr,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    /// Capture wall-clock in nanoseconds
    pub timestamp: i64,
    pub data: Bytes,
}

impl TcpPacket {
    /// Direction relative to the captured port set, or `None` when neither
    /// endpoint is captured
    pub fn direction(&self, captured_ports: &HashSet<u16>) -> Option<Direction> {
        if captured_ports.contains(&self.dst_port) {
            Some(Direction::Incoming)
        } else if captured_ports.contains(&self.src_port) {
            Some(Direction::Outgoing)
        } else {
            None
        }
    }

    /// Flow key with the captured side normalized to the server position
    pub fn flow_key(&self, direction: Direction) -> FlowKey {
        match direction {
            Direction::Incoming => FlowKey {
                client: SocketAddr::new(self.src_addr, self.src_port),
                server: SocketAddr::new(self.dst_addr, self.dst_port),
            },
            Direction::Outgoing => FlowKey {
                client: SocketAddr::new(self.dst_addr, self.dst_port),
                server: SocketAddr::new(self.src_addr, self.src_port),
            },
        }
    }
}

/// Ordered 4-tuple identifying one TCP connection; the server side is the
/// captured port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub client: SocketAddr,
    pub server: SocketAddr,
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}<->{}", self.client, self.server)
    }
}

/// Localhost address used by tests and synthetic packet builders
pub const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(src_port: u16, dst_port: u16) -> TcpPacket {
        TcpPacket {
            src_addr: LOOPBACK,
            src_port,
            dst_addr: LOOPBACK,
            dst_port,
            seq: 1,
            ack: 1,
            flags: TcpFlags::default(),
            timestamp: 0,
            data: Bytes::new(),
        }
    }

    #[test]
    fn test_direction_from_ports() {
        let ports: HashSet<u16> = [80].into_iter().collect();
        assert_eq!(packet(40000, 80).direction(&ports), Some(Direction::Incoming));
        assert_eq!(packet(80, 40000).direction(&ports), Some(Direction::Outgoing));
        assert_eq!(packet(40000, 443).direction(&ports), None);
    }

    #[test]
    fn test_flow_key_normalizes_server_side() {
        let ports: HashSet<u16> = [80].into_iter().collect();
        let req = packet(40000, 80);
        let resp = packet(80, 40000);

        let req_key = req.flow_key(req.direction(&ports).unwrap());
        let resp_key = resp.flow_key(resp.direction(&ports).unwrap());
        assert_eq!(req_key, resp_key);
        assert_eq!(req_key.server.port(), 80);
    }
}
