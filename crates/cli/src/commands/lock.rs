use std::collections::BTreeSet;

use serde::Serialize;

use crate::cli::LockAction;
use crate::context::RelayContext;
use crate::error::Result;
use crate::output::{OutputFormat, ResultBuilder, print_result};

#[derive(Debug, Serialize)]
struct FlagStatus {
	tag: String,
	busy: bool,
	age_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
struct Released {
	tag: String,
	removed: bool,
}

pub fn execute(ctx: &RelayContext, action: LockAction, format: OutputFormat) -> Result<()> {
	match action {
		LockAction::Status { tags } => {
			let tags = if tags.is_empty() { known_tags(ctx) } else { tags };
			let statuses = tags
				.into_iter()
				.map(|tag| -> Result<FlagStatus> {
					Ok(FlagStatus {
						busy: ctx.lock.is_busy(&tag)?,
						age_secs: ctx.lock.age(&tag)?.map(|age| age.as_secs()),
						tag,
					})
				})
				.collect::<Result<Vec<_>>>()?;
			print_result(&ResultBuilder::new("lock status").data(statuses).build(), format);
		}
		LockAction::Release { tag } => {
			let removed = ctx.lock.release(&tag)?;
			print_result(&ResultBuilder::new("lock release").data(Released { tag, removed }).build(), format);
		}
	}
	Ok(())
}

/// Every tag a configured workflow sets or waits on.
fn known_tags(ctx: &RelayContext) -> Vec<String> {
	ctx.config
		.workflows
		.0
		.iter()
		.flat_map(|workflow| std::iter::once(&workflow.lock_tag).chain(&workflow.defer_while))
		.filter(|tag| !tag.is_empty())
		.cloned()
		.collect::<BTreeSet<_>>()
		.into_iter()
		.collect()
}
