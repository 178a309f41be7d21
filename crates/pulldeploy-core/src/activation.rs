use std::path::{Path, PathBuf};

use async_trait::async_trait;
use better_command::Cmd;
use tracing::{info, warn};

use crate::error::Result;
use crate::settings::DeployMode;

/// Coarse classification of an activation attempt's outcome, used by the
/// orchestrator to route to `Fail` (no mutation happened) vs `Rollback`
/// (the running system may have changed) vs `Succeed`/`Verify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
	Ok,
	EvalFailed,
	BuildFailed,
	ActivateFailed,
}

#[derive(Debug, Clone)]
pub struct ActivationResult {
	pub built_toplevel: Option<PathBuf>,
	pub effective_mode: DeployMode,
	pub kernel_changed: bool,
	pub exit_kind: ExitKind,
}

/// Component C. Invokes the system-rebuild tool; classifies outcomes;
/// detects kernel/initrd change against the running system.
#[async_trait]
pub trait ActivationDriver: Send + Sync {
	async fn activate(&self, mode: DeployMode, commit_worktree: &Path) -> Result<ActivationResult>;
}

pub struct ProcessActivationDriver {
	rebuild_command: String,
}

impl ProcessActivationDriver {
	pub fn new(rebuild_command: impl Into<String>) -> Self {
		Self {
			rebuild_command: rebuild_command.into(),
		}
	}

	/// Reads `dir/kernel` and `dir/initrd` symlink targets. A toplevel
	/// without an `initrd` (e.g. some container profiles) reports it as
	/// `None`, which only compares equal to another `None`.
	fn read_kernel_initrd(dir: &Path) -> (Option<PathBuf>, Option<PathBuf>) {
		let kernel = std::fs::read_link(dir.join("kernel")).ok();
		let initrd = std::fs::read_link(dir.join("initrd")).ok();
		(kernel, initrd)
	}

	/// Compares the built toplevel's kernel/initrd against the currently
	/// running system's. Per the documented pessimistic default, any file
	/// we can't read (missing `/run/booted-system`, e.g. in a dev/test
	/// sandbox) counts as "changed" so we never skip a reboot we should
	/// have taken.
	fn kernel_changed(built_toplevel: &Path) -> bool {
		let running = Path::new("/run/booted-system");
		if !running.exists() {
			return true;
		}
		let (built_kernel, built_initrd) = Self::read_kernel_initrd(built_toplevel);
		let (running_kernel, running_initrd) = Self::read_kernel_initrd(running);
		match (built_kernel, running_kernel) {
			(Some(a), Some(b)) if a == b => {}
			_ => return true,
		}
		match (built_initrd, running_initrd) {
			(Some(a), Some(b)) if a == b => {}
			_ => return true,
		}
		false
	}

	fn classify_build_failure(stderr: &str) -> ExitKind {
		// The rebuild tool doesn't expose a machine-readable distinction
		// between a Nix evaluation error and a derivation build failure;
		// both surface through the same non-zero exit. We fall back to a
		// substring heuristic on stderr, erring toward `BuildFailed` (the
		// more common case) when neither phrase appears.
		if stderr.contains("error: evaluation") || stderr.contains("while evaluating") {
			ExitKind::EvalFailed
		} else {
			ExitKind::BuildFailed
		}
	}

	/// Returns the built toplevel, or an `(ExitKind, message)` pair
	/// classifying why the build-or-eval step failed.
	async fn build(&self, commit_worktree: &Path) -> std::result::Result<PathBuf, (ExitKind, String)> {
		let mut cmd = Cmd::new(&self.rebuild_command);
		cmd.comparg("-C", commit_worktree.as_os_str()).arg("build");
		match cmd.run().await {
			Ok(out) => {
				let path = out
					.stdout
					.lines()
					.last()
					.unwrap_or_default()
					.trim()
					.to_string();
				Ok(PathBuf::from(path))
			}
			Err(e) => {
				let stderr = e.stderr().unwrap_or_default();
				let kind = Self::classify_build_failure(stderr);
				warn!(%e, "build failed");
				Err((kind, e.to_string()))
			}
		}
	}

	fn activation_subcommand(mode: DeployMode) -> &'static str {
		match mode {
			DeployMode::Test => "test",
			DeployMode::Switch => "switch",
			DeployMode::Boot | DeployMode::Reboot => "boot",
			DeployMode::RebootOnKernelChange => {
				unreachable!("resolved before invoking switch-to-configuration")
			}
		}
	}
}

#[async_trait]
impl ActivationDriver for ProcessActivationDriver {
	async fn activate(&self, mode: DeployMode, commit_worktree: &Path) -> Result<ActivationResult> {
		let built = match self.build(commit_worktree).await {
			Ok(path) => path,
			Err((exit_kind, _message)) => {
				return Ok(ActivationResult {
					built_toplevel: None,
					effective_mode: mode,
					kernel_changed: false,
					exit_kind,
				});
			}
		};

		let kernel_changed = Self::kernel_changed(&built);
		let effective_mode = match mode {
			DeployMode::RebootOnKernelChange => {
				if kernel_changed {
					DeployMode::Reboot
				} else {
					DeployMode::Switch
				}
			}
			other => other,
		};

		info!(%effective_mode, kernel_changed, toplevel = %built.display(), "activating");
		let switch_script = built.join("bin/switch-to-configuration");
		let mut cmd = Cmd::new(&switch_script);
		cmd.arg(Self::activation_subcommand(effective_mode));
		match cmd.run().await {
			Ok(_) => Ok(ActivationResult {
				built_toplevel: Some(built),
				effective_mode,
				kernel_changed,
				exit_kind: ExitKind::Ok,
			}),
			Err(e) => {
				warn!(%e, "activation script failed");
				Ok(ActivationResult {
					built_toplevel: Some(built),
					effective_mode,
					kernel_changed,
					exit_kind: ExitKind::ActivateFailed,
				})
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn classifies_evaluation_errors() {
		assert_eq!(
			ProcessActivationDriver::classify_build_failure("error: evaluation aborted"),
			ExitKind::EvalFailed
		);
		assert_eq!(
			ProcessActivationDriver::classify_build_failure("builder for '/nix/store/x.drv' failed"),
			ExitKind::BuildFailed
		);
	}

	#[test]
	fn missing_booted_system_is_treated_as_changed() {
		let dir = tempfile::tempdir().unwrap();
		assert!(ProcessActivationDriver::kernel_changed(dir.path()));
	}
}
