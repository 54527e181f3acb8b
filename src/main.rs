mod bpf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn, Level};

use ebpf_rwnd_fairness::classifier::load_classifier;
use ebpf_rwnd_fairness::config::{self, MonitorConfig};
use ebpf_rwnd_fairness::decision::Policy;
use ebpf_rwnd_fairness::flow::FlowTable;
use ebpf_rwnd_fairness::mitigation::{Actuator, RwndTable};
use ebpf_rwnd_fairness::monitor::{Dispatch, Evaluator, Inference, Monitor};
use ebpf_rwnd_fairness::reaction::{ReactionStrategy, Schedule};
use ebpf_rwnd_fairness::worker;

use bpf::{DatapathOptions, EbpfDatapath};

const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const SCHEDULE_STRATEGY: &str = "file";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Topology {
    /// Evaluate flows on the control-loop thread.
    Threaded,
    /// Hand batches to a separate inference worker.
    Pipeline,
}

#[derive(Parser)]
#[command(name = "rwnd-fairness")]
#[command(about = "Per-flow TCP fairness enforcement through receive-window rewriting")]
struct Args {
    /// Interface whose egress traffic carries the rewritten windows.
    #[arg(short, long)]
    interface: String,

    /// Cgroup to attach the window-scale sock_ops hook to.
    #[arg(long)]
    cgroup: Option<PathBuf>,

    #[arg(long, default_value = "ebpf/rwnd.bpf.o")]
    bpf_object: PathBuf,

    /// Classifier artifact (JSON).
    #[arg(short, long)]
    model_file: Option<PathBuf>,

    /// aimd, mimd, or file (follow --schedule).
    #[arg(short, long, default_value = "aimd")]
    reaction_strategy: String,

    /// RWND schedule, required by the file strategy.
    #[arg(short, long)]
    schedule: Option<PathBuf>,

    #[arg(long, default_value_t = config::DEFAULT_INTERVAL_MS)]
    interval_ms: u64,

    /// Packets a flow must buffer before it is evaluated.
    #[arg(long, default_value_t = config::DEFAULT_LIMIT)]
    limit: usize,

    #[arg(long, default_value_t = config::DEFAULT_BUFFER_CAP)]
    buffer_cap: usize,

    /// Feature rows passed to the classifier.
    #[arg(long, default_value_t = config::DEFAULT_WINDOW)]
    window: usize,

    #[arg(long, default_value_t = config::DEFAULT_IDLE_SECS)]
    idle_secs: u64,

    #[arg(long, value_enum, default_value_t = Topology::Threaded)]
    topology: Topology,

    #[arg(long, default_value_t = config::DEFAULT_QUEUE_DEPTH)]
    queue_depth: usize,

    /// Track flows without classifying or pacing them.
    #[arg(long)]
    disable_inference: bool,

    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_millis(self.interval_ms),
            limit: self.limit,
            buffer_cap: self.buffer_cap,
            window: self.window,
            idle_threshold: Duration::from_secs(self.idle_secs),
            queue_depth: self.queue_depth,
            disable_inference: self.disable_inference,
        }
    }

    fn policy(&self) -> Result<Policy> {
        if self.reaction_strategy == SCHEDULE_STRATEGY {
            let path = self
                .schedule
                .as_ref()
                .context("The 'file' reaction strategy requires --schedule")?;
            let schedule = Schedule::parse(path)
                .with_context(|| format!("Failed to load schedule {:?}", path))?;
            return Ok(Policy::Schedule(schedule));
        }
        if self.schedule.is_some() {
            anyhow::bail!("--schedule is only used with --reaction-strategy file");
        }
        let strategy = ReactionStrategy::get(&self.reaction_strategy).with_context(|| {
            format!(
                "Choose one of: {}, {}",
                ReactionStrategy::list().join(", "),
                SCHEDULE_STRATEGY
            )
        })?;
        Ok(Policy::React(strategy))
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = args.monitor_config();
    config.validate().context("Invalid configuration")?;
    let policy = args.policy()?;

    info!("Starting RWND fairness enforcement");
    info!("  interface: {}", args.interface);
    info!("  reaction strategy: {}", policy.name());
    info!("  topology: {:?}", args.topology);
    info!("  interval: {:?}, limit: {} packets", config.interval, config.limit);

    let inference = match (&args.model_file, config.disable_inference) {
        (_, true) => {
            info!("Inference disabled, flows will only be tracked");
            None
        }
        (Some(path), false) => {
            let classifier = load_classifier(path)?;
            Some(Inference::new(classifier, config.window)?)
        }
        (None, false) => None,
    };

    let done = Arc::new(AtomicBool::new(false));
    {
        let done = done.clone();
        ctrlc::set_handler(move || done.store(true, Ordering::Relaxed))
            .context("Failed to install signal handler")?;
    }

    let flows = Arc::new(FlowTable::new(config.buffer_cap));
    let datapath = EbpfDatapath::new(
        &DatapathOptions {
            object: args.bpf_object.clone(),
            interface: args.interface.clone(),
            cgroup: args.cgroup.clone(),
        },
        flows.clone(),
    )?;
    let table: Arc<dyn RwndTable> = Arc::new(datapath.rwnd_map()?);
    let actuator = Actuator::new(table);

    let mut threads = Vec::new();
    let dispatch = if config.disable_inference {
        Dispatch::Disabled
    } else {
        let evaluator = Evaluator::new(policy, inference, actuator.clone())?;
        match args.topology {
            Topology::Threaded => Dispatch::Inline(evaluator),
            Topology::Pipeline => {
                let (submitter, mut worker) = worker::pipeline(config.queue_depth, evaluator);
                threads.push(spawn_stoppable("inference", done.clone(), move |done| {
                    worker.run(done).map_err(Into::into)
                })?);
                Dispatch::Pipeline(submitter)
            }
        }
    };

    let mut monitor = Monitor::new(flows, actuator, dispatch, config);
    threads.push(spawn_stoppable("control", done.clone(), move |done| {
        monitor.run(done)
    })?);

    info!("Entering event loop...");
    while !done.load(Ordering::Relaxed) {
        if let Err(e) = datapath.poll(POLL_TIMEOUT) {
            warn!("Failed to poll datapath: {:#}", e);
        }
    }
    info!("Shutting down");

    let mut result = Ok(());
    for handle in threads {
        let outcome = handle
            .join()
            .map_err(|_| anyhow::anyhow!("Worker thread panicked"))
            .and_then(|r| r);
        if let Err(e) = outcome {
            if result.is_ok() {
                result = Err(e);
            }
        }
    }
    drop(datapath);
    result
}

/// Spawn a named thread that sets `done` when it exits, so a fatal error in
/// one thread stops the others.
fn spawn_stoppable<F>(name: &str, done: Arc<AtomicBool>, f: F) -> Result<JoinHandle<Result<()>>>
where
    F: FnOnce(&AtomicBool) -> Result<()> + Send + 'static,
{
    let thread_name = name.to_string();
    thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let result = f(&done);
            if let Err(e) = &result {
                error!("{} thread failed: {:#}", thread_name, e);
            }
            done.store(true, Ordering::Relaxed);
            result
        })
        .with_context(|| format!("Failed to spawn {} thread", name))
}
