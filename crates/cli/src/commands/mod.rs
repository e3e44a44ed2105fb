mod lock;
mod port;
mod run;
mod sessions;

use crate::cli::{Cli, Commands};
use crate::config::RelayConfig;
use crate::context::RelayContext;
use crate::error::Result;
use crate::output::{ResultBuilder, print_result};

pub async fn dispatch(cli: Cli) -> Result<()> {
	let config = RelayConfig::load(cli.config.as_deref())?;

	match cli.command {
		Commands::Run(args) => run::execute(RelayContext::new(config), args, cli.format).await?,
		Commands::Sessions { action } => sessions::execute(&RelayContext::new(config), action, cli.format).await?,
		Commands::Lock { action } => lock::execute(&RelayContext::new(config), action, cli.format)?,
		Commands::Port { preferred } => port::execute(&config, preferred, cli.format)?,
		Commands::Config => print_result(&ResultBuilder::new("config").data(&config).build(), cli.format),
	}

	Ok(())
}
