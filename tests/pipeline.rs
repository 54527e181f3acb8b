use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ebpf_rwnd_fairness::classifier::{forest::Node, forest::Tree, DecisionForest};
use ebpf_rwnd_fairness::config::MonitorConfig;
use ebpf_rwnd_fairness::decision::Policy;
use ebpf_rwnd_fairness::features::THR_ESTIMATE_FET;
use ebpf_rwnd_fairness::flow::FlowTable;
use ebpf_rwnd_fairness::mitigation::{Actuator, MemoryRwndTable};
use ebpf_rwnd_fairness::monitor::{Dispatch, Evaluator, Inference, Monitor};
use ebpf_rwnd_fairness::reaction::ReactionStrategy;
use ebpf_rwnd_fairness::worker::pipeline;
use ebpf_rwnd_fairness::{FlowKey, PacketSample};

fn key(port: u16) -> FlowKey {
    FlowKey::new(
        u32::from_le_bytes([10, 0, 0, 1]),
        u32::from_le_bytes([10, 0, 0, 2]),
        port,
        9000,
    )
}

fn segments(n: u32) -> Vec<PacketSample> {
    (0..n)
        .map(|i| PacketSample {
            seq: i * 1448,
            rtt_us: 10_000,
            total_bytes: 1500,
            payload_bytes: 1448,
            time_us: 1_000 + u64::from(i) * 1000,
            ..Default::default()
        })
        .collect()
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn worker_paces_submitted_flows_and_forgets_collected_ones() {
    let config = MonitorConfig {
        limit: 11,
        ..Default::default()
    };
    // Always above fair.
    let forest = DecisionForest::new(
        vec![THR_ESTIMATE_FET.to_string()],
        vec![Tree {
            nodes: vec![Node::Leaf { leaf: 2 }],
        }],
    )
    .unwrap();
    let rwnd = Arc::new(MemoryRwndTable::new());
    let actuator = Actuator::new(rwnd.clone());
    let evaluator = Evaluator::new(
        Policy::React(ReactionStrategy::Aimd),
        Some(Inference::new(Box::new(forest), config.window).unwrap()),
        actuator.clone(),
    )
    .unwrap();

    let (submitter, mut worker) = pipeline(config.queue_depth, evaluator);
    let done = Arc::new(AtomicBool::new(false));
    let worker_thread = {
        let done = done.clone();
        thread::spawn(move || worker.run(&done).map(|_| worker.tracked_flows()))
    };

    let flows = Arc::new(FlowTable::new(config.buffer_cap));
    let mut monitor = Monitor::new(
        flows.clone(),
        actuator,
        Dispatch::Pipeline(submitter),
        config,
    );

    let start = Instant::now();
    for port in [1, 2] {
        for pkt in segments(11) {
            flows.ingest(key(port), pkt, start);
        }
    }
    let stats = monitor.run_cycle(start).unwrap();
    assert_eq!(stats.checked, 2);
    assert!(wait_for(|| rwnd.len() == 2));
    assert_eq!(rwnd.get(&key(1)), Some(7500));
    assert_eq!(rwnd.get(&key(2)), Some(7500));

    // Both flows went idle: GC removes them here and evicts them in the worker.
    let stats = monitor.run_cycle(start + Duration::from_secs(301)).unwrap();
    assert_eq!(stats.removed, 2);
    assert!(rwnd.is_empty());

    drop(monitor);
    let tracked = worker_thread.join().unwrap().unwrap();
    assert_eq!(tracked, 0);
    assert!(!done.load(Ordering::Relaxed));
}
