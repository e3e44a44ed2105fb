use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::{info, warn};

use crate::cli::RunArgs;
use crate::context::RelayContext;
use crate::error::{RelayError, Result};
use crate::instance::InstanceGuard;
use crate::output::{OutputFormat, ResultBuilder, print_result};
use crate::queue::WorkQueue;
use crate::scheduler::Scheduler;
use crate::session::connect::prune_profiles;
use crate::session::{ReconcileReport, ShutdownReport};
use crate::workflow::{RunReport, Workflow};

#[derive(Debug, Serialize)]
struct RunSummary {
	reconciled: ReconcileReport,
	pruned_profiles: usize,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	runs: Vec<RunReport>,
	generated: usize,
	shutdown: ShutdownReport,
}

pub async fn execute(ctx: RelayContext, args: RunArgs, format: OutputFormat) -> Result<()> {
	let _instance = InstanceGuard::acquire(ctx.config.pid_file())?;

	let reconciled = ctx.lifecycle.reconcile().await?;
	let owners: HashSet<String> = ctx.config.workflows.0.iter().map(|workflow| workflow.owner.clone()).collect();
	let pruned = prune_profiles(&ctx.config.profiles_dir(), &owners)?;

	let queue = ctx.queue();
	let workflows = ctx.workflows(&args.owners, queue.clone())?;
	if workflows.is_empty() {
		return Err(RelayError::Config("no enabled workflows to run".into()));
	}

	let runs = if args.once {
		run_once(&workflows, queue.as_ref()).await
	} else {
		run_scheduled(&ctx, &workflows, queue.as_ref(), Duration::from_secs(args.delay_secs)).await?;
		Vec::new()
	};

	let summary = RunSummary {
		reconciled,
		pruned_profiles: pruned.len(),
		runs,
		generated: queue.as_ref().map(|queue| queue.progress().generated).unwrap_or(0),
		shutdown: ctx.lifecycle.shutdown_all().await?,
	};
	print_result(&ResultBuilder::new("run").data(summary).build(), format);
	Ok(())
}

/// Runs every workflow back to back, then lets the queue drain.
async fn run_once(workflows: &[Arc<Workflow>], queue: Option<&WorkQueue>) -> Vec<RunReport> {
	let mut reports = Vec::with_capacity(workflows.len());
	for workflow in workflows {
		reports.push(workflow.run_once().await);
	}
	if let Some(queue) = queue {
		queue.wait_idle().await;
		queue.request_stop();
		queue.join().await;
	}
	reports
}

/// Arms every workflow and runs the scheduler until Ctrl-C, then waits for in-flight runs.
async fn run_scheduled(ctx: &RelayContext, workflows: &[Arc<Workflow>], queue: Option<&WorkQueue>, delay: Duration) -> Result<()> {
	let scheduler = Scheduler::new(&ctx.config.scheduler);
	let first_run = SystemTime::now() + delay;
	for workflow in workflows {
		Arc::clone(workflow).arm_recurring(&scheduler, first_run);
	}

	let handle = scheduler.spawn();
	info!(target = "relay", workflows = workflows.len(), "relay running; press Ctrl-C to stop");

	tokio::signal::ctrl_c().await?;
	info!(target = "relay", "interrupt received; shutting down");

	scheduler.shutdown();
	if let Err(err) = handle.await {
		warn!(target = "relay", error = %err, "scheduler task ended abnormally");
	}
	scheduler.drain(ctx.config.scheduler.drain_timeout()).await;
	if let Some(queue) = queue {
		queue.request_stop();
		queue.join().await;
	}
	Ok(())
}
