use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use pulldeploy_core::activation::ProcessActivationDriver;
use pulldeploy_core::generations::NixGenerationRegistry;
use pulldeploy_core::hook::ProcessHookInvoker;
use pulldeploy_core::orchestrator::{Orchestrator, RunOptions, RunOutcome, SystemdRebootTrigger};
use pulldeploy_core::reachability::GitReachabilityProbe;
use pulldeploy_core::vcs::GitGateway;
use pulldeploy_core::Settings;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "pulldeploy", about = "Pull-based configuration deployment")]
struct Cli {
	/// Path to the TOML configuration file.
	#[arg(short = 'c', long = "config", env = "DEPLOY_CONFIG")]
	config: PathBuf,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Sync, select the target commit, and activate it if it differs from
	/// what's currently running.
	Run {
		/// Bypass the "already up to date" shortcut and redeploy anyway.
		#[arg(long)]
		force: bool,
		/// Treat every activation as terminal; never roll back on a
		/// failed reachability probe.
		#[arg(long)]
		no_magic_rollback: bool,
	},
	/// Report the selected target and whether it differs from the current
	/// deployment, without activating anything.
	Check,
}

fn init_tracing() {
	use tracing_subscriber::{fmt, EnvFilter};
	fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();
}

fn build_orchestrator(settings: Settings) -> anyhow::Result<Orchestrator> {
	let hostname = hostname::get()?.to_string_lossy().into_owned();
	let git_binary = settings.git_command.clone();
	let rebuild_binary = settings.rebuild_command.clone();
	let profile_dir = PathBuf::from("/nix/var/nix/profiles");
	Ok(Orchestrator {
		vcs: Box::new(GitGateway::new(git_binary.clone())),
		probe: Box::new(GitReachabilityProbe::new(git_binary)),
		activation: Box::new(ProcessActivationDriver::new(rebuild_binary.clone())),
		registry: Box::new(NixGenerationRegistry::new(profile_dir, "system", rebuild_binary)),
		hook: Box::new(ProcessHookInvoker),
		reboot: Box::new(SystemdRebootTrigger),
		hostname,
		settings,
	})
}

#[tokio::main]
async fn main() -> ExitCode {
	init_tracing();
	let cli = Cli::parse();

	let settings = match Settings::load(&cli.config) {
		Ok(s) => s,
		Err(e) => {
			error!(%e, "failed to load configuration");
			return ExitCode::from(2);
		}
	};

	let orchestrator = match build_orchestrator(settings) {
		Ok(o) => o,
		Err(e) => {
			error!(%e, "failed to initialize");
			return ExitCode::from(2);
		}
	};

	match cli.command {
		Command::Run {
			force,
			no_magic_rollback,
		} => run(orchestrator, force, no_magic_rollback).await,
		Command::Check => check(orchestrator).await,
	}
}

async fn run(orchestrator: Orchestrator, force: bool, no_magic_rollback: bool) -> ExitCode {
	let scheduled = std::env::var_os("INVOCATION_ID").is_some();
	let cancel = Arc::new(AtomicBool::new(false));
	let cancel_for_signal = cancel.clone();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			cancel_for_signal.store(true, Ordering::SeqCst);
		}
	});

	let opts = RunOptions {
		force,
		no_magic_rollback,
		scheduled,
	};
	match orchestrator.run(opts, &cancel).await {
		RunOutcome::UpToDate => ExitCode::from(0),
		RunOutcome::Succeeded { commit, rebooted } => {
			info!(%commit, rebooted, "deployment succeeded");
			ExitCode::from(0)
		}
		RunOutcome::Failed(e) => {
			error!(%e, "deployment failed");
			ExitCode::from(1)
		}
		RunOutcome::Aborted(e) => {
			error!(%e, "deployment aborted");
			ExitCode::from(2)
		}
		RunOutcome::Busy => {
			error!("another deployment is already running");
			ExitCode::from(2)
		}
	}
}

async fn check(orchestrator: Orchestrator) -> ExitCode {
	match orchestrator.check().await {
		Ok(outcome) => {
			info!(
				target = %outcome.target.commit,
				kind = %outcome.target.kind,
				current = ?outcome.current,
				up_to_date = outcome.up_to_date,
				"check complete"
			);
			if outcome.up_to_date {
				ExitCode::from(0)
			} else {
				ExitCode::from(10)
			}
		}
		Err(e) => {
			error!(%e, "check failed");
			ExitCode::from(2)
		}
	}
}
