use std::path::PathBuf;

use serde::Serialize;

use crate::cli::SessionsAction;
use crate::context::RelayContext;
use crate::error::Result;
use crate::output::{OutputFormat, ResultBuilder, print_result};
use crate::session::SessionRecord;

#[derive(Debug, Serialize)]
struct SessionRow {
	owner: String,
	pid: u32,
	port: u16,
	alive: bool,
	started_at: u64,
	profile_dir: Option<PathBuf>,
}

impl From<SessionRecord> for SessionRow {
	fn from(record: SessionRecord) -> Self {
		Self {
			alive: record.is_alive(),
			owner: record.owner,
			pid: record.pid,
			port: record.port,
			started_at: record.started_at,
			profile_dir: record.profile_dir,
		}
	}
}

pub async fn execute(ctx: &RelayContext, action: SessionsAction, format: OutputFormat) -> Result<()> {
	match action {
		SessionsAction::List => {
			let rows: Vec<SessionRow> = ctx.lifecycle.registry().list_all()?.into_iter().map(SessionRow::from).collect();
			print_result(&ResultBuilder::new("sessions list").data(rows).build(), format);
		}
		SessionsAction::KillAll => {
			let report = ctx.lifecycle.shutdown_all().await?;
			print_result(&ResultBuilder::new("sessions kill-all").data(report).build(), format);
		}
	}
	Ok(())
}
