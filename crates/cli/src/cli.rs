use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(about = "Relay - scheduled browser sessions for harvest and publish workflows")]
#[command(version)]
pub struct Cli {
	/// Increase verbosity (-v info, -vv debug)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	/// Config file (defaults to the user config dir)
	#[arg(short, long, global = true, value_name = "FILE")]
	pub config: Option<PathBuf>,

	/// Output format for command results
	#[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
	pub format: OutputFormat,

	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// Start the scheduler and run workflows until interrupted
	Run(RunArgs),

	/// Inspect or clean up registered browser sessions
	Sessions {
		#[command(subcommand)]
		action: SessionsAction,
	},

	/// Inspect or clear advisory busy flags
	Lock {
		#[command(subcommand)]
		action: LockAction,
	},

	/// Show which debugging port a launch would use
	Port {
		/// Preferred port; fallbacks are tried when it is taken
		preferred: u16,
	},

	/// Print the effective configuration
	Config,
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
	/// Run each selected workflow once and exit instead of scheduling
	#[arg(long)]
	pub once: bool,

	/// Only run these owners (repeatable); defaults to every enabled workflow
	#[arg(long = "owner", value_name = "OWNER")]
	pub owners: Vec<String>,

	/// Seconds to wait before the first scheduled run
	#[arg(long, default_value_t = 0)]
	pub delay_secs: u64,
}

#[derive(Subcommand, Debug)]
pub enum SessionsAction {
	/// List registered sessions and whether their process is alive
	#[command(alias = "ls")]
	List,

	/// Terminate every registered browser and clear the registry
	KillAll,
}

#[derive(Subcommand, Debug)]
pub enum LockAction {
	/// Show flag state for the given tags (defaults to every workflow's tags)
	Status { tags: Vec<String> },

	/// Remove a flag regardless of who set it
	Release { tag: String },
}

#[cfg(test)]
mod tests {
	use clap::CommandFactory;

	use super::*;

	#[test]
	fn cli_definition_is_consistent() {
		Cli::command().debug_assert();
	}

	#[test]
	fn global_flags_parse_after_subcommand() {
		let cli = Cli::try_parse_from(["relay", "sessions", "list", "-vv", "--format", "json", "--config", "/tmp/relay.json"]).unwrap();
		assert_eq!(cli.verbose, 2);
		assert_eq!(cli.format, OutputFormat::Json);
		assert_eq!(cli.config, Some(PathBuf::from("/tmp/relay.json")));
		assert!(matches!(cli.command, Commands::Sessions { action: SessionsAction::List }));
	}

	#[test]
	fn run_accepts_repeated_owners() {
		let cli = Cli::try_parse_from(["relay", "run", "--once", "--owner", "scrape", "--owner", "post"]).unwrap();
		let Commands::Run(args) = cli.command else {
			panic!("expected run");
		};
		assert!(args.once);
		assert_eq!(args.owners, ["scrape", "post"]);
	}
}
