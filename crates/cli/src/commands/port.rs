use serde::Serialize;

use crate::config::RelayConfig;
use crate::context::port_allocator;
use crate::error::{LaunchError, Result};
use crate::output::{OutputFormat, ResultBuilder, print_result};

#[derive(Debug, Serialize)]
struct PortReport {
	preferred: u16,
	port: u16,
	fallback: bool,
}

pub fn execute(config: &RelayConfig, preferred: u16, format: OutputFormat) -> Result<()> {
	let port = port_allocator(config).allocate(preferred).map_err(LaunchError::from)?;
	let report = PortReport {
		preferred,
		port,
		fallback: port != preferred,
	};
	print_result(&ResultBuilder::new("port").data(report).build(), format);
	Ok(())
}
