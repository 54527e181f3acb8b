use anyhow::{Context, Result};
use ebpf_rwnd_fairness::flow::{FlowTable, Ingest};
use ebpf_rwnd_fairness::mitigation::RwndTable;
use ebpf_rwnd_fairness::{FlowKey, PacketSample, FLOW_KEY_LEN};
use libbpf_rs::{
    ErrorKind, Link, MapCore, MapFlags, MapHandle, Object, ObjectBuilder, RingBuffer,
    RingBufferBuilder, TcHook, TcHookBuilder, TC_EGRESS,
};
use nix::net::if_::if_nametoindex;
use std::fs::File;
use std::os::fd::{AsFd, AsRawFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

const PKTS_MAP: &str = "pkts";
const RWND_MAP: &str = "flow_to_rwnd";
const RCV_PROG: &str = "trace_tcp_rcv";
const RCV_KPROBE: &str = "tcp_rcv_established";
const EGRESS_PROG: &str = "handle_egress";
const WIN_SCALE_PROG: &str = "read_win_scale";

/// One received packet as written by the kernel into `pkts`.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
struct PacketEvent {
    saddr: u32,
    daddr: u32,
    sport: u16,
    dport: u16,
    seq: u32,
    srtt_us: u32,
    tsval: u32,
    tsecr: u32,
    total_bytes: u32,
    ihl_bytes: u16,
    thl_bytes: u16,
    payload_bytes: u32,
    time_us: u64,
}

impl PacketEvent {
    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < std::mem::size_of::<Self>() {
            return None;
        }
        // SAFETY: length checked above; PacketEvent is plain old data.
        Some(unsafe { std::ptr::read_unaligned(data.as_ptr() as *const Self) })
    }

    fn key(&self) -> FlowKey {
        FlowKey::new(self.saddr, self.daddr, self.sport, self.dport)
    }

    fn sample(&self) -> PacketSample {
        PacketSample {
            seq: self.seq,
            rtt_us: self.srtt_us,
            tsval: self.tsval,
            tsecr: self.tsecr,
            total_bytes: self.total_bytes,
            ihl_bytes: self.ihl_bytes,
            thl_bytes: self.thl_bytes,
            payload_bytes: self.payload_bytes,
            time_us: self.time_us,
        }
    }
}

pub struct DatapathOptions {
    pub object: PathBuf,
    pub interface: String,
    pub cgroup: Option<PathBuf>,
}

/// Loaded kernel object with its hooks attached. Hooks are removed on drop.
pub struct EbpfDatapath {
    ring: RingBuffer<'static>,
    egress: TcHook,
    _links: Vec<Link>,
    obj: Object,
}

impl EbpfDatapath {
    /// Load the object, attach every hook, and route packet events into `flows`.
    pub fn new(opts: &DatapathOptions, flows: Arc<FlowTable>) -> Result<Self> {
        info!("Loading eBPF object file: {:?}", opts.object);
        if !opts.object.exists() {
            anyhow::bail!(
                "eBPF object file not found: {:?}. Run 'make' in ebpf/ first.",
                opts.object
            );
        }

        let mut builder = ObjectBuilder::default();
        builder.debug(tracing::enabled!(tracing::Level::DEBUG));
        let mut obj = builder
            .open_file(&opts.object)
            .context("Failed to open BPF object file")?
            .load()
            .context("Failed to load BPF object into kernel")?;
        info!("BPF object loaded");

        let mut links = Vec::new();
        {
            let prog = obj
                .progs_mut()
                .find(|p| p.name() == RCV_PROG)
                .with_context(|| format!("Failed to find '{}' program", RCV_PROG))?;
            links.push(
                prog.attach_kprobe(false, RCV_KPROBE)
                    .with_context(|| format!("Failed to attach kprobe to {}", RCV_KPROBE))?,
            );
            info!("Attached {} to {}", RCV_PROG, RCV_KPROBE);
        }

        if let Some(cgroup) = &opts.cgroup {
            let dir = File::open(cgroup)
                .with_context(|| format!("Failed to open cgroup {:?}", cgroup))?;
            let prog = obj
                .progs_mut()
                .find(|p| p.name() == WIN_SCALE_PROG)
                .with_context(|| format!("Failed to find '{}' program", WIN_SCALE_PROG))?;
            links.push(
                prog.attach_cgroup(dir.as_raw_fd())
                    .with_context(|| format!("Failed to attach sock_ops to {:?}", cgroup))?,
            );
            info!("Attached {} to cgroup {:?}", WIN_SCALE_PROG, cgroup);
        }

        let ifindex = interface_index(&opts.interface)?;
        let egress = {
            let prog = obj
                .progs()
                .find(|p| p.name() == EGRESS_PROG)
                .with_context(|| format!("Failed to find '{}' program", EGRESS_PROG))?;
            let mut tc_builder = TcHookBuilder::new(prog.as_fd());
            tc_builder.ifindex(ifindex).replace(true).handle(1).priority(1);
            let mut egress = tc_builder.hook(TC_EGRESS);
            egress
                .create()
                .context("Failed to create clsact qdisc")?;
            egress
                .attach()
                .with_context(|| format!("Failed to attach TC egress on {}", opts.interface))?;
            egress
        };
        info!("Attached {} to egress of {} ({})", EGRESS_PROG, opts.interface, ifindex);

        let ring = {
            let pkts = obj
                .maps()
                .find(|m| m.name() == PKTS_MAP)
                .with_context(|| format!("Failed to find '{}' map", PKTS_MAP))?;
            let mut rb_builder = RingBufferBuilder::new();
            rb_builder
                .add(&pkts, move |data: &[u8]| {
                    receive_packet(&flows, data);
                    0
                })
                .context("Failed to add packet ring buffer")?;
            rb_builder.build().context("Failed to build ring buffer")?
        };
        info!("Ring buffer configured");

        Ok(Self {
            ring,
            egress,
            _links: links,
            obj,
        })
    }

    /// Deliver pending packet events to the flow table.
    pub fn poll(&self, timeout: Duration) -> Result<()> {
        self.ring.poll(timeout).context("Ring buffer poll failed")
    }

    /// A thread-safe view of the kernel's flow → RWND table.
    pub fn rwnd_map(&self) -> Result<RwndMap> {
        let map = self
            .obj
            .maps()
            .find(|m| m.name() == RWND_MAP)
            .with_context(|| format!("Failed to find '{}' map", RWND_MAP))?;
        anyhow::ensure!(
            map.key_size() as usize == FLOW_KEY_LEN && map.value_size() == 4,
            "'{}' has key/value sizes {}/{}, expected {}/4",
            RWND_MAP,
            map.key_size(),
            map.value_size(),
            FLOW_KEY_LEN
        );
        let map = MapHandle::try_from(&map).context("Failed to duplicate RWND map handle")?;
        Ok(RwndMap { map })
    }
}

impl Drop for EbpfDatapath {
    fn drop(&mut self) {
        if let Err(e) = self.egress.detach() {
            warn!("Failed to detach TC egress hook: {}", e);
        }
        if let Err(e) = self.egress.destroy() {
            warn!("Failed to destroy clsact qdisc: {}", e);
        }
        info!("eBPF hooks removed");
    }
}

fn receive_packet(flows: &FlowTable, data: &[u8]) {
    let Some(event) = PacketEvent::parse(data) else {
        warn!("Short packet event: {} bytes", data.len());
        return;
    };
    let key = event.key();
    if key.is_loopback() {
        return;
    }
    let sample = event.sample();
    trace!("Packet {}: {}", key, sample);
    match flows.ingest(key, sample, Instant::now()) {
        Ingest::NewFlow => debug!("New flow {}", key),
        Ingest::Stored => {}
        Ingest::TableBusy => trace!("Flow table busy, dropped packet for {}", key),
        Ingest::FlowBusy => trace!("Flow {} busy, dropped packet", key),
    }
}

fn interface_index(interface: &str) -> Result<i32> {
    let index = if_nametoindex(interface)
        .with_context(|| format!("Unknown interface {:?}", interface))?;
    i32::try_from(index).with_context(|| format!("ifindex {} out of range", index))
}

/// The kernel's `flow_to_rwnd` map.
pub struct RwndMap {
    map: MapHandle,
}

impl RwndTable for RwndMap {
    fn set(&self, key: &FlowKey, rwnd_bytes: u32) -> Result<()> {
        self.map
            .update(&key.to_bytes(), &rwnd_bytes.to_le_bytes(), MapFlags::ANY)
            .with_context(|| format!("Failed to set RWND for flow {}", key))
    }

    fn remove(&self, key: &FlowKey) -> Result<()> {
        match self.map.delete(&key.to_bytes()) {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.kind(), ErrorKind::NotFound) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to clear RWND for flow {}", key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interfaces_resolve_by_name() {
        assert!(interface_index("lo").unwrap() > 0);
        assert!(interface_index("no-such-if0").is_err());
    }

    #[test]
    fn packet_events_decode_in_kernel_layout() {
        assert_eq!(std::mem::size_of::<PacketEvent>(), 48);

        let mut raw = Vec::new();
        raw.extend_from_slice(&u32::from_le_bytes([10, 0, 0, 1]).to_le_bytes());
        raw.extend_from_slice(&u32::from_le_bytes([10, 0, 0, 2]).to_le_bytes());
        raw.extend_from_slice(&5201u16.to_le_bytes());
        raw.extend_from_slice(&40000u16.to_le_bytes());
        for v in [7u32, 2500, 11, 12, 1500] {
            raw.extend_from_slice(&v.to_le_bytes());
        }
        raw.extend_from_slice(&20u16.to_le_bytes());
        raw.extend_from_slice(&32u16.to_le_bytes());
        raw.extend_from_slice(&1448u32.to_le_bytes());
        raw.extend_from_slice(&123_456u64.to_le_bytes());

        let event = PacketEvent::parse(&raw).unwrap();
        assert_eq!(event.key().to_string(), "10.0.0.1:5201 -> 10.0.0.2:40000");
        let sample = event.sample();
        assert_eq!(sample.seq, 7);
        assert_eq!(sample.rtt(), Some(2500));
        assert_eq!(sample.payload_bytes, 1448);
        assert_eq!(sample.time_us, 123_456);

        assert!(PacketEvent::parse(&raw[..40]).is_none());
    }

    #[test]
    fn loopback_packets_are_not_tracked() {
        let flows = FlowTable::new(10);
        let event = PacketEvent {
            saddr: ebpf_rwnd_fairness::LOCALHOST,
            daddr: u32::from_le_bytes([10, 0, 0, 2]),
            sport: 1,
            dport: 2,
            seq: 0,
            srtt_us: 0,
            tsval: 0,
            tsecr: 0,
            total_bytes: 60,
            ihl_bytes: 20,
            thl_bytes: 20,
            payload_bytes: 20,
            time_us: 1,
        };
        let raw = unsafe {
            std::slice::from_raw_parts(
                &event as *const PacketEvent as *const u8,
                std::mem::size_of::<PacketEvent>(),
            )
        };
        receive_packet(&flows, raw);
        assert!(flows.is_empty());

        let event = PacketEvent { saddr: u32::from_le_bytes([10, 0, 0, 1]), ..event };
        let raw = unsafe {
            std::slice::from_raw_parts(
                &event as *const PacketEvent as *const u8,
                std::mem::size_of::<PacketEvent>(),
            )
        };
        receive_packet(&flows, raw);
        assert_eq!(flows.len(), 1);
    }
}
