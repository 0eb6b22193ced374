use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use devalloc::cli::{allocate_on_nodes, format_dry_run, format_outcomes, select_nodes, Args, NodeOutcome};
use devalloc::config::load_scenario_file;
use devalloc::selector::SelectorCache;

fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Load and validate scenario
    let scenario = match load_scenario_file(&args.scenario_file) {
        Ok(s) => s,
        Err(e) => {
            error!(
                "Failed to load scenario file {}: {}",
                args.scenario_file.display(),
                e
            );
            process::exit(1);
        }
    };

    // Dry-run mode: print scenario summary and exit
    if args.dry_run {
        let output = format_dry_run(&scenario, &args);
        println!("{}", output);
        return;
    }

    let nodes = match select_nodes(&scenario, &args.nodes) {
        Ok(nodes) => nodes,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    let allocator = match scenario.allocator(Arc::new(SelectorCache::default())) {
        Ok(a) => a,
        Err(e) => {
            error!("Failed to build allocator: {}", e);
            process::exit(1);
        }
    };

    let ctx = CancellationToken::new();
    if let Some(secs) = args.timeout {
        let ctx = ctx.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(secs));
            warn!("Timeout of {}s reached, cancelling allocation", secs);
            ctx.cancel();
        });
    }

    info!(
        "Allocating {} claims on {} nodes (at most {} devices per claim)",
        allocator.claims().len(),
        nodes.len(),
        allocator.config().max_devices_per_claim
    );
    let reports = allocate_on_nodes(&allocator, &nodes, &ctx);
    for report in &reports {
        match &report.outcome {
            NodeOutcome::Allocated { .. } => info!("Node {}: allocated", report.node),
            NodeOutcome::Unschedulable => info!("Node {}: unschedulable", report.node),
            NodeOutcome::Error { message } => warn!("Node {}: {}", report.node, message),
        }
    }

    match format_outcomes(&reports, args.output) {
        Ok(output) => println!("{}", output),
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    }
}
