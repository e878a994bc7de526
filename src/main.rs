use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use workloop::config::Config;
use workloop::process::{
    BatchProcess, Command as WorkCommand, Deployment, ManagerEvent, ManagerRegistry, NodeId,
    RunOutcome, SessionId,
};
use workloop::progress::{ManualClock, ProgressNode, TickScheduler};
use workloop::sim::{FailureMode, SimDeployment};
use workloop::{wlog, wlog_error, Error, Result};

/// Workloop - progress estimation and distributed work loops
#[derive(Parser, Debug)]
#[command(name = "workloop")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    WORKLOOP_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.workloop/workloop.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a batch of work units over simulated deployments
    Simulate {
        /// Number of deployments
        #[arg(long, default_value_t = 2)]
        nodes: usize,

        /// Number of work units
        #[arg(long, default_value_t = 8)]
        units: usize,

        /// Latency of every simulated update, in milliseconds
        #[arg(long, default_value_t = 100)]
        latency_ms: u64,

        /// Index of a deployment that fails every update
        #[arg(long)]
        fail_node: Option<usize>,
    },

    /// Print the estimated progress curve of an auto task
    Estimate {
        /// Expected duration in seconds
        #[arg(long)]
        seconds: f64,

        /// How far to follow the curve, in seconds (defaults to three times the estimate)
        #[arg(long)]
        until: Option<f64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    workloop::log::init_with_debug(cli.debug);
    let config = Config::load()?;
    if let Some(path) = config.log_path() {
        workloop::log::init_at(&path, workloop::log::get_level());
    }
    wlog!("workloop starting: {:?}", cli.command);

    let result = match cli.command {
        Command::Simulate {
            nodes,
            units,
            latency_ms,
            fail_node,
        } => run_simulate(&config, nodes, units, latency_ms, fail_node),
        Command::Estimate { seconds, until } => run_estimate(seconds, until.unwrap_or(seconds * 3.0)),
    };
    if let Err(e) = &result {
        wlog_error!("workloop failed: {}", e);
    }
    result
}

fn run_simulate(
    config: &Config,
    nodes: usize,
    units: usize,
    latency_ms: u64,
    fail_node: Option<usize>,
) -> Result<()> {
    if nodes == 0 {
        return Err(Error::Validation("--nodes must be > 0".to_string()));
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let registry = ManagerRegistry::new(config.max_managers, config.manager_config()).with_events(tx);
        let session = SessionId::new();
        let manager = registry.manager(session);

        let scheduler = TickScheduler::with_period(config.tick_interval());
        let root = ProgressNode::root_with(&scheduler);
        let work: Vec<Vec<WorkCommand>> = (0..units)
            .map(|i| vec![WorkCommand::exec("bench", &[&format!("--unit={}", i)])])
            .collect();
        let process = Arc::new(BatchProcess::new("simulate", work).with_progress(&root, "units", "Work units"));

        let deployments: Vec<Arc<dyn Deployment>> = (0..nodes)
            .map(|i| {
                let mut sim = SimDeployment::new(format!("node-{}", i))
                    .with_latency(Duration::from_millis(latency_ms));
                if fail_node == Some(i) {
                    sim = sim.failing(FailureMode::Always);
                }
                Arc::new(sim) as Arc<dyn Deployment>
            })
            .collect();

        println!("Session {}: {} units on {} nodes", session.short(), units, nodes);

        let printer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    ManagerEvent::WorkDone { .. } => {}
                    ManagerEvent::DeploymentFailed { node, error, .. } => {
                        println!("  {} failed: {}", node, error);
                    }
                    ManagerEvent::Completed { .. } => break,
                    other => println!("  {:?}", other),
                }
            }
        });

        let progress = {
            let root = root.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(250));
                loop {
                    interval.tick().await;
                    match root.leading_task(true) {
                        Some(task) => println!(
                            "  {:<12} {:>5.1}%  ({:.0}/{:.0})",
                            task.label(),
                            task.percent(),
                            task.count(),
                            task.total()
                        ),
                        None => println!("  all tasks done"),
                    }
                    if root.is_completed() {
                        break;
                    }
                }
            })
        };

        let outcome = manager.run(process.clone(), deployments).await;
        progress.abort();
        if outcome == RunOutcome::Completed {
            let _ = printer.await;
        } else {
            printer.abort();
        }

        println!();
        println!("Outcome:   {:?}", outcome);
        println!("Done:      {}/{}", process.done(), process.total());
        println!("Abandoned: {}", process.abandoned());
        for i in 0..nodes {
            let node = NodeId::from(format!("node-{}", i));
            println!("  {:<8} {} updates", node, manager.work_cnt(&node));
        }
        for (node, failure) in manager.failures() {
            println!("  {:<8} last failure at {}: {}", node, failure.at.format("%H:%M:%S"), failure.error);
        }
        println!("{}", root);

        if outcome == RunOutcome::Completed {
            Ok(())
        } else {
            Err(Error::Validation(format!("run ended as {:?}", outcome)))
        }
    })
}

fn validate_estimate(seconds: f64, until: f64) -> Result<()> {
    if !seconds.is_finite() || !until.is_finite() {
        return Err(Error::Validation("durations must be finite".to_string()));
    }
    if seconds < 0.0 || until < 0.0 {
        return Err(Error::Validation("durations must be >= 0".to_string()));
    }
    Ok(())
}

fn run_estimate(seconds: f64, until: f64) -> Result<()> {
    validate_estimate(seconds, until)?;

    let clock = Arc::new(ManualClock::new(0.0));
    let scheduler = TickScheduler::with_clock(clock.clone());
    let root = ProgressNode::root_with(&scheduler);
    let task = root.start_auto_task("auto", "Estimated task", seconds);

    println!("Estimate {}s, following for {}s", seconds, until);
    let steps = until.ceil() as u64;
    for second in 1..=steps {
        clock.set_ms(second as f64 * 1000.0);
        scheduler.tick_all();
        println!(
            "  t={:>4}s  count={:>8.3}  total={:>8.3}  {:>5.1}%",
            second,
            task.count(),
            task.total(),
            task.percent()
        );
    }
    task.close();
    println!("closed    count={:>8.3}  total={:>8.3}", task.count(), task.total());
    Ok(())
}
