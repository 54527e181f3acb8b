//! Per-flow TCP fairness enforcement through receive-window rewriting.
//!
//! The kernel side captures packets and rewrites the advertised window of
//! every flow that has an entry in the shared `flow_to_rwnd` map. This crate
//! is the control plane: it tracks flows, featurizes their packets, asks a
//! classifier whether each flow is below, at, or above its fair share, and
//! writes the resulting window into the map.

use std::fmt;
use std::net::Ipv4Addr;

pub mod classifier;
pub mod config;
pub mod decision;
pub mod error;
pub mod features;
pub mod flow;
pub mod mitigation;
pub mod monitor;
pub mod reaction;
pub mod worker;

/// 127.0.0.1 as the kernel stores it (little-endian).
pub const LOCALHOST: u32 = u32::from_le_bytes([127, 0, 0, 1]);

/// Size of a serialized [`FlowKey`] in the shared map.
pub const FLOW_KEY_LEN: usize = 12;

/// Four-tuple identifying a TCP flow. Matches `struct flow` on the kernel side.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    pub saddr: u32,
    pub daddr: u32,
    pub sport: u16,
    pub dport: u16,
}

impl FlowKey {
    pub const fn new(saddr: u32, daddr: u32, sport: u16, dport: u16) -> Self {
        Self {
            saddr,
            daddr,
            sport,
            dport,
        }
    }

    /// Byte layout used as the key of the kernel-visible maps.
    pub fn to_bytes(&self) -> [u8; FLOW_KEY_LEN] {
        let mut buf = [0u8; FLOW_KEY_LEN];
        buf[0..4].copy_from_slice(&self.saddr.to_le_bytes());
        buf[4..8].copy_from_slice(&self.daddr.to_le_bytes());
        buf[8..10].copy_from_slice(&self.sport.to_le_bytes());
        buf[10..12].copy_from_slice(&self.dport.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; FLOW_KEY_LEN]) -> Self {
        Self {
            saddr: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            daddr: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            sport: u16::from_le_bytes([buf[8], buf[9]]),
            dport: u16::from_le_bytes([buf[10], buf[11]]),
        }
    }

    pub fn is_loopback(&self) -> bool {
        self.saddr == LOCALHOST || self.daddr == LOCALHOST
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Addresses are already little-endian, so the bytes are in dotted-quad order.
        write!(
            f,
            "{}:{} -> {}:{}",
            Ipv4Addr::from(self.saddr.to_le_bytes()),
            self.sport,
            Ipv4Addr::from(self.daddr.to_le_bytes()),
            self.dport
        )
    }
}

/// Per-packet metrics reported by the kernel for a received segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketSample {
    pub seq: u32,
    /// RTT estimate in microseconds, 0 when the collection point has none.
    pub rtt_us: u32,
    pub tsval: u32,
    pub tsecr: u32,
    pub total_bytes: u32,
    pub ihl_bytes: u16,
    pub thl_bytes: u16,
    pub payload_bytes: u32,
    /// Arrival time on the monotonic clock, in microseconds.
    pub time_us: u64,
}

impl PacketSample {
    pub fn rtt(&self) -> Option<u32> {
        (self.rtt_us > 0).then_some(self.rtt_us)
    }
}

impl fmt::Display for PacketSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "seq: {}, rtt: {} us, tsval: {}, tsecr: {}, total: {} B, IP header: {} B, \
             TCP header: {} B, payload: {} B, time: {} us",
            self.seq,
            self.rtt_us,
            self.tsval,
            self.tsecr,
            self.total_bytes,
            self.ihl_bytes,
            self.thl_bytes,
            self.payload_bytes,
            self.time_us
        )
    }
}

/// A flow's throughput relative to its fair share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Label {
    BelowFair,
    #[default]
    ApproxFair,
    AboveFair,
}

impl Label {
    /// Maps a classifier class index onto a label.
    pub fn from_class(class: usize) -> Option<Self> {
        match class {
            0 => Some(Self::BelowFair),
            1 => Some(Self::ApproxFair),
            2 => Some(Self::AboveFair),
            _ => None,
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BelowFair => "below-fair",
            Self::ApproxFair => "approx-fair",
            Self::AboveFair => "above-fair",
        };
        f.write_str(s)
    }
}

/// Mitigation state of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Decision {
    #[default]
    NotPaced,
    /// Advertised window to impose, in bytes.
    Paced(u32),
}

impl Decision {
    pub fn rwnd(&self) -> Option<u32> {
        match self {
            Self::NotPaced => None,
            Self::Paced(rwnd) => Some(*rwnd),
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotPaced => f.write_str("not paced"),
            Self::Paced(rwnd) => write!(f, "paced at {} B", rwnd),
        }
    }
}
