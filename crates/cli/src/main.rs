use clap::Parser;
use relay_cli::cli::Cli;
use relay_cli::output::{CommandError, OutputFormat, ResultBuilder, print_error_stderr, print_result};
use relay_cli::{commands, logging};
use tracing::error;

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	logging::init_logging(cli.verbose);
	let format = cli.format;

	if let Err(err) = commands::dispatch(cli).await {
		error!(target = "relay", error = %err, "command failed");
		match format {
			OutputFormat::Text => print_error_stderr(&CommandError::from(&err)),
			_ => print_result(&ResultBuilder::<()>::new("relay").relay_error(&err).build(), format),
		}
		std::process::exit(1);
	}
}
